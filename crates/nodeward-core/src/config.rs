use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::failover::MembershipTag;
use crate::naming::{self, StorePaths};

/// Config file read when neither `--config` nor `NODEWARD_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodeward/nodeward.toml";

/// Top-level nodeward configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct NodewardConfig {
    pub cluster: ClusterSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub join: JoinSection,
    #[serde(default)]
    pub automation: AutomationSection,
    #[serde(default)]
    pub boot: BootSection,
    #[serde(default)]
    pub failover: Option<FailoverSection>,
}

/// Cluster identity; scopes every coordination store key.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    pub environment: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Explicit key prefix, overriding `/{name}/{environment}`.
    #[serde(default)]
    pub store_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Ssm,
    Etcd,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// etcd endpoints (e.g. "http://10.0.0.5:2379").
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,
    /// 32-byte hex key used to encrypt secure values at rest (etcd backend).
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Join-Credential Consumer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinSection {
    #[serde(default = "default_join_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_join_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    /// Present once the node has joined; its existence skips the join step.
    #[serde(default = "default_kubelet_conf")]
    pub kubelet_conf: PathBuf,
}

/// Remote automation run settings. Without a document, boot runs the
/// local step sequence directly.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationSection {
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootSection {
    /// Hard outer bound on the whole boot sequence (seconds).
    #[serde(default = "default_boot_deadline")]
    pub deadline_secs: u64,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Where markers and the install-path decision are kept.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Script run on the full-install path.
    #[serde(default)]
    pub install_script: Option<String>,
    /// Present once the control plane is initialized.
    #[serde(default = "default_admin_conf")]
    pub admin_conf: PathBuf,
    #[serde(default = "default_k8s_version")]
    pub k8s_version: String,
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    #[serde(default)]
    pub signal: SignalSection,
}

/// Where the boot verdict is sent. Without a stack and resource the
/// verdict is only logged.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SignalSection {
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverSection {
    pub allocation_id: String,
    #[serde(default = "default_tag_key")]
    pub membership_tag_key: String,
    pub membership_tag_value: String,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_region() -> String {
    "eu-west-1".to_string()
}
fn default_join_attempts() -> u32 {
    30
}
fn default_join_interval() -> u64 {
    20
}
fn default_join_timeout() -> u64 {
    120
}
fn default_kubelet_conf() -> PathBuf {
    PathBuf::from("/etc/kubernetes/kubelet.conf")
}
fn default_poll_interval() -> u64 {
    15
}
fn default_boot_deadline() -> u64 {
    1800
}
fn default_status_file() -> PathBuf {
    PathBuf::from("/tmp/bootstrap-status.json")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/nodeward")
}
fn default_admin_conf() -> PathBuf {
    PathBuf::from("/etc/kubernetes/admin.conf")
}
fn default_k8s_version() -> String {
    "1.35.1".to_string()
}
fn default_pod_cidr() -> String {
    "192.168.0.0/16".to_string()
}
fn default_service_cidr() -> String {
    "10.96.0.0/12".to_string()
}
fn default_tag_key() -> String {
    "Cluster".to_string()
}
fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9740))
}

impl Default for JoinSection {
    fn default() -> Self {
        Self {
            max_attempts: default_join_attempts(),
            retry_interval_secs: default_join_interval(),
            join_timeout_secs: default_join_timeout(),
            kubelet_conf: default_kubelet_conf(),
        }
    }
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            document: None,
            poll_interval_secs: default_poll_interval(),
            parameters: BTreeMap::new(),
        }
    }
}

impl Default for BootSection {
    fn default() -> Self {
        Self {
            deadline_secs: default_boot_deadline(),
            status_file: default_status_file(),
            state_dir: default_state_dir(),
            install_script: None,
            admin_conf: default_admin_conf(),
            k8s_version: default_k8s_version(),
            pod_cidr: default_pod_cidr(),
            service_cidr: default_service_cidr(),
            signal: SignalSection::default(),
        }
    }
}

impl NodewardConfig {
    /// Load from `path`, else `NODEWARD_CONFIG`, else the default path,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("NODEWARD_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read nodeward config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse nodeward config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// `NODEWARD_ENV`, `NODEWARD_REGION` and `NODEWARD_STORE_PREFIX` win
    /// over file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("NODEWARD_ENV") {
            self.cluster.environment = env;
        }
        if let Ok(region) = std::env::var("NODEWARD_REGION") {
            self.cluster.region = region;
        }
        if let Ok(prefix) = std::env::var("NODEWARD_STORE_PREFIX") {
            self.cluster.store_prefix = Some(prefix);
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        naming::validate_segment(&self.cluster.name, "Cluster name")?;
        naming::validate_segment(&self.cluster.environment, "Environment")?;
        if let Some(prefix) = &self.cluster.store_prefix {
            StorePaths::from_prefix(prefix)?;
        }
        if self.join.max_attempts == 0 {
            anyhow::bail!("[join] max_attempts must be at least 1");
        }
        if self.automation.poll_interval_secs == 0 {
            anyhow::bail!("[automation] poll_interval_secs must be greater than 0");
        }
        if self.store.backend == StoreBackend::Etcd && self.store.etcd_endpoints.is_empty() {
            anyhow::bail!("[store] backend = \"etcd\" requires at least one etcd_endpoints entry");
        }
        if let Some(failover) = &self.failover {
            if failover.allocation_id.trim().is_empty() {
                anyhow::bail!("[failover] allocation_id must not be empty");
            }
            if failover.membership_tag_value.trim().is_empty() {
                anyhow::bail!("[failover] membership_tag_value must not be empty");
            }
        }
        Ok(())
    }

    /// Coordination store key layout for this cluster environment.
    pub fn paths(&self) -> Result<StorePaths> {
        match &self.cluster.store_prefix {
            Some(prefix) => StorePaths::from_prefix(prefix),
            None => StorePaths::new(&self.cluster.name, &self.cluster.environment),
        }
    }

    pub fn failover(&self) -> Result<&FailoverSection> {
        self.failover
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Config has no [failover] section"))
    }
}

impl JoinSection {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl AutomationSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl BootSection {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl FailoverSection {
    pub fn membership_tag(&self) -> MembershipTag {
        MembershipTag::new(&self.membership_tag_key, &self.membership_tag_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[cluster]
name = "k8s"
environment = "development"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = NodewardConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.cluster.region, "eu-west-1");
        assert_eq!(config.store.backend, StoreBackend::Ssm);
        assert_eq!(config.join.max_attempts, 30);
        assert_eq!(config.join.retry_interval(), Duration::from_secs(20));
        assert_eq!(config.automation.poll_interval(), Duration::from_secs(15));
        assert!(config.automation.document.is_none());
        assert_eq!(config.boot.deadline(), Duration::from_secs(1800));
        assert!(config.failover.is_none());
        assert_eq!(config.paths().unwrap().prefix(), "/k8s/development");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[cluster]
name = "k8s"
environment = "production"
region = "us-east-1"

[store]
backend = "etcd"
etcd_endpoints = ["http://10.0.0.5:2379"]
key_file = "/etc/nodeward/store.key"

[join]
max_attempts = 3
retry_interval_secs = 1

[automation]
document = "k8s-bootstrap-control-plane"
poll_interval_secs = 10

[automation.parameters]
SsmPrefix = "/k8s/production"

[boot]
deadline_secs = 900
install_script = "/opt/nodeward/install.sh"

[boot.signal]
stack = "K8s-Compute"
resource = "ControlPlaneAsg"

[failover]
allocation_id = "eipalloc-0abc"
membership_tag_value = "k8s-production"
listen = "0.0.0.0:9740"
"#;
        let config = NodewardConfig::parse(toml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Etcd);
        assert_eq!(config.join.max_attempts, 3);
        assert_eq!(
            config.automation.document.as_deref(),
            Some("k8s-bootstrap-control-plane")
        );
        assert_eq!(
            config.automation.parameters.get("SsmPrefix").map(String::as_str),
            Some("/k8s/production")
        );
        assert_eq!(config.boot.signal.stack.as_deref(), Some("K8s-Compute"));
        let failover = config.failover().unwrap();
        assert_eq!(failover.membership_tag().key, "Cluster");
        assert_eq!(failover.membership_tag().value, "k8s-production");
    }

    #[test]
    fn test_store_prefix_override() {
        let toml = r#"
[cluster]
name = "k8s"
environment = "development"
store_prefix = "/platform/k8s/dev"
"#;
        let config = NodewardConfig::parse(toml).unwrap();
        assert_eq!(
            config.paths().unwrap().join_token(),
            "/platform/k8s/dev/join-token"
        );
    }

    #[test]
    fn test_reject_invalid_environment() {
        let toml = r#"
[cluster]
name = "k8s"
environment = "Dev"
"#;
        let err = format!("{}", NodewardConfig::parse(toml).unwrap_err());
        assert!(err.contains("Environment"));
    }

    #[test]
    fn test_reject_zero_join_attempts() {
        let toml = format!("{}\n[join]\nmax_attempts = 0\n", MINIMAL);
        let err = format!("{}", NodewardConfig::parse(&toml).unwrap_err());
        assert!(err.contains("max_attempts"));
    }

    #[test]
    fn test_reject_etcd_without_endpoints() {
        let toml = format!("{}\n[store]\nbackend = \"etcd\"\n", MINIMAL);
        let err = format!("{}", NodewardConfig::parse(&toml).unwrap_err());
        assert!(err.contains("etcd_endpoints"));
    }

    #[test]
    fn test_reject_empty_allocation_id() {
        let toml = format!(
            "{}\n[failover]\nallocation_id = \"\"\nmembership_tag_value = \"k8s\"\n",
            MINIMAL
        );
        assert!(NodewardConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_missing_failover_section() {
        let config = NodewardConfig::parse(MINIMAL).unwrap();
        let err = format!("{}", config.failover().unwrap_err());
        assert!(err.contains("[failover]"));
    }

    #[test]
    fn test_from_file_missing() {
        let err = NodewardConfig::from_file(Path::new("/nonexistent/nodeward.toml")).unwrap_err();
        assert!(format!("{}", err).contains("Failed to read"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodeward.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = NodewardConfig::from_file(&path).unwrap();
        assert_eq!(config.cluster.name, "k8s");
    }
}
