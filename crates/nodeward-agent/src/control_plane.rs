use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use nodeward_core::clock::Clock;
use nodeward_core::join::{CaFingerprint, ControlPlaneEndpoint, JoinToken};
use nodeward_core::poll::{Attempt, Poller};
use nodeward_core::shell::Cmd;

use crate::kubeconfig::KubeconfigDistributor;

/// Node-local view of the control plane this node runs.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Initialize the control plane advertising `endpoint`.
    async fn init(&self, endpoint: &ControlPlaneEndpoint, extra_sans: &[String]) -> Result<()>;

    /// Register a bootstrap token with the running control plane.
    async fn register_token(&self, token: &JoinToken) -> Result<()>;

    /// Public-key pin of the cluster CA.
    async fn ca_fingerprint(&self) -> Result<CaFingerprint>;

    /// Whether the API server answered after `init`.
    async fn wait_ready(&self, _clock: &dyn Clock) -> bool {
        true
    }

    /// Maintenance for a node whose control plane already exists: renew
    /// the kubeadm-managed certificates.
    async fn renew_certificates(&self) -> Result<()> {
        Ok(())
    }

    /// Give operator accounts a kubeconfig for this control plane.
    async fn configure_kubectl(&self) -> Result<()> {
        Ok(())
    }

    /// Read-only post-boot health check.
    async fn verify(&self) -> Result<ClusterHealth> {
        Ok(ClusterHealth {
            node_ready: true,
            namespaces: BTreeMap::new(),
        })
    }
}

/// Pod counts for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodCounts {
    pub healthy: usize,
    pub total: usize,
}

/// Outcome of [`ControlPlane::verify`]. Problems are reported, not fatal:
/// a fresh control plane often has pods still starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHealth {
    pub node_ready: bool,
    pub namespaces: BTreeMap<String, PodCounts>,
}

impl ClusterHealth {
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.node_ready {
            warnings.push("no node is Ready".to_string());
        }
        for (ns, counts) in &self.namespaces {
            if counts.healthy < counts.total {
                warnings.push(format!("{}: {}/{} pods healthy", ns, counts.healthy, counts.total));
            }
        }
        warnings
    }
}

/// Whether any row of `kubectl get nodes --no-headers` is Ready.
fn any_node_ready(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|status| status.split(',').any(|s| s == "Ready"))
}

/// Count Running or Completed rows of `kubectl get pods --no-headers`.
fn count_pods(output: &str) -> PodCounts {
    let rows: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let healthy = rows
        .iter()
        .filter(|row| {
            row.split_whitespace()
                .nth(2)
                .is_some_and(|status| matches!(status, "Running" | "Completed"))
        })
        .count();
    PodCounts {
        healthy,
        total: rows.len(),
    }
}

/// `kubeadm`-managed control plane.
#[derive(Debug, Clone)]
pub struct KubeadmControlPlane {
    pub admin_conf: PathBuf,
    pub ca_cert: PathBuf,
    pub k8s_version: String,
    pub pod_cidr: String,
    pub service_cidr: String,
    pub kubectl_access: KubeconfigDistributor,
    /// Namespaces whose pods `verify` counts.
    pub verify_namespaces: Vec<String>,
}

impl KubeadmControlPlane {
    pub fn new(admin_conf: &Path, k8s_version: &str, pod_cidr: &str, service_cidr: &str) -> Self {
        Self {
            admin_conf: admin_conf.to_path_buf(),
            ca_cert: PathBuf::from("/etc/kubernetes/pki/ca.crt"),
            k8s_version: k8s_version.to_string(),
            pod_cidr: pod_cidr.to_string(),
            service_cidr: service_cidr.to_string(),
            kubectl_access: KubeconfigDistributor::new(admin_conf),
            verify_namespaces: vec!["kube-system".to_string()],
        }
    }

    fn kubectl(&self) -> Cmd {
        Cmd::new("kubectl")
            .env("KUBECONFIG", &self.kubeconfig())
            .timeout(Duration::from_secs(30))
    }

    fn kubeconfig(&self) -> String {
        self.admin_conf.display().to_string()
    }
}

/// Shell pipeline printing the SHA-256 of the CA's DER-encoded public key.
fn ca_digest_script(ca_cert: &Path) -> String {
    format!(
        "openssl x509 -pubkey -in {} | openssl rsa -pubin -outform der 2>/dev/null | openssl dgst -sha256 -hex",
        ca_cert.display()
    )
}

#[async_trait]
impl ControlPlane for KubeadmControlPlane {
    async fn init(&self, endpoint: &ControlPlaneEndpoint, extra_sans: &[String]) -> Result<()> {
        info!(k8s_version = %self.k8s_version, endpoint = %endpoint, "Running kubeadm init");
        let mut sans = vec![endpoint.host.clone()];
        sans.extend(extra_sans.iter().cloned());
        Cmd::new("kubeadm")
            .arg("init")
            .arg(format!("--kubernetes-version={}", self.k8s_version))
            .arg(format!("--pod-network-cidr={}", self.pod_cidr))
            .arg(format!("--service-cidr={}", self.service_cidr))
            .arg(format!("--control-plane-endpoint={}", endpoint))
            .arg(format!("--apiserver-cert-extra-sans={}", sans.join(",")))
            .arg("--upload-certs")
            .timeout(Duration::from_secs(300))
            .checked()
            .await
            .context("kubeadm init failed")?;
        Ok(())
    }

    async fn register_token(&self, token: &JoinToken) -> Result<()> {
        Cmd::new("kubeadm")
            .args(["token", "create"])
            .secret(token.expose())
            .args(["--ttl", "24h"])
            .env("KUBECONFIG", &self.kubeconfig())
            .checked()
            .await
            .context("kubeadm token create failed")?;
        Ok(())
    }

    async fn ca_fingerprint(&self) -> Result<CaFingerprint> {
        let out = Cmd::script(&ca_digest_script(&self.ca_cert))
            .checked()
            .await
            .context("Failed to compute CA public key hash")?;
        Ok(CaFingerprint::from_digest_output(&out.stdout)?)
    }

    /// Polls `kubectl get nodes` once a second for up to 90s.
    async fn wait_ready(&self, clock: &dyn Clock) -> bool {
        let kubeconfig = self.kubeconfig();
        let result = Poller::new(clock, "control plane API", Duration::from_secs(1))
            .max_attempts(90)
            .run(|_| {
                let kubeconfig = kubeconfig.clone();
                async move {
                    match Cmd::new("kubectl")
                        .args(["get", "nodes"])
                        .env("KUBECONFIG", &kubeconfig)
                        .timeout(Duration::from_secs(10))
                        .output()
                        .await
                    {
                        Ok(out) if out.success() => Attempt::Ready(()),
                        Ok(out) => Attempt::Retry(format!("kubectl exit {}", out.code)),
                        Err(e) => Attempt::<(), anyhow::Error>::Retry(e.to_string()),
                    }
                }
            })
            .await;
        match result {
            Ok(polled) => {
                info!(waited_secs = polled.attempts, "Control plane is ready");
                true
            }
            Err(e) => {
                warn!(error = %e, "Control plane did not become ready");
                false
            }
        }
    }

    async fn renew_certificates(&self) -> Result<()> {
        info!("Control plane already initialized, renewing certificates");
        Cmd::new("kubeadm")
            .args(["certs", "renew", "all"])
            .env("KUBECONFIG", &self.kubeconfig())
            .timeout(Duration::from_secs(120))
            .checked()
            .await
            .context("kubeadm certs renew failed")?;
        if let Ok(out) = Cmd::new("kubeadm")
            .args(["certs", "check-expiration"])
            .env("KUBECONFIG", &self.kubeconfig())
            .output()
            .await
        {
            info!(expiration = %out.stdout_trimmed(), "Certificate expiration after renewal");
        }
        Ok(())
    }

    async fn configure_kubectl(&self) -> Result<()> {
        self.kubectl_access.distribute().await?;
        Ok(())
    }

    async fn verify(&self) -> Result<ClusterHealth> {
        let nodes = self
            .kubectl()
            .args(["get", "nodes", "--no-headers"])
            .checked()
            .await
            .context("Cannot query nodes")?;
        let mut namespaces = BTreeMap::new();
        for ns in &self.verify_namespaces {
            let out = self
                .kubectl()
                .args(["get", "pods", "-n", ns.as_str(), "--no-headers"])
                .output()
                .await?;
            if out.success() {
                namespaces.insert(ns.clone(), count_pods(&out.stdout));
            } else {
                warn!(namespace = %ns, "Cannot list pods");
            }
        }
        Ok(ClusterHealth {
            node_ready: any_node_ready(&nodes.stdout),
            namespaces,
        })
    }
}
