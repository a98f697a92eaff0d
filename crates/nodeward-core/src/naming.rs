use anyhow::{Result, bail};

/// Validate a cluster or environment name: lowercase alphanumeric + hyphens, 1-63 chars.
pub fn validate_segment(segment: &str, kind: &str) -> Result<()> {
    if segment.is_empty() || segment.len() > 63 {
        bail!("{} must be 1-63 characters, got {}", kind, segment.len());
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "{} must be lowercase alphanumeric + hyphens: {:?}",
            kind,
            segment
        );
    }
    if segment.starts_with('-') || segment.ends_with('-') {
        bail!("{} must not start or end with a hyphen: {:?}", kind, segment);
    }
    Ok(())
}

/// Coordination store key layout for one cluster environment.
///
/// Every key lives under `/{cluster}/{env}` so two environments sharing a
/// store never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    prefix: String,
}

impl StorePaths {
    pub fn new(cluster: &str, environment: &str) -> Result<Self> {
        validate_segment(cluster, "Cluster name")?;
        validate_segment(environment, "Environment")?;
        Ok(Self {
            prefix: format!("/{}/{}", cluster, environment),
        })
    }

    /// Use an explicit prefix such as `/k8s/development`.
    pub fn from_prefix(prefix: &str) -> Result<Self> {
        let trimmed = prefix.trim_end_matches('/');
        if !trimmed.starts_with('/') || trimmed.len() < 2 {
            bail!("Store prefix must be an absolute path, got {:?}", prefix);
        }
        for segment in trimmed[1..].split('/') {
            validate_segment(segment, "Store prefix segment")?;
        }
        Ok(Self {
            prefix: trimmed.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for an arbitrary relative name under the prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name.trim_start_matches('/'))
    }

    pub fn join_token(&self) -> String {
        self.key("join-token")
    }

    pub fn ca_fingerprint(&self) -> String {
        self.key("ca-hash")
    }

    pub fn control_plane_endpoint(&self) -> String {
        self.key("control-plane-endpoint")
    }

    pub fn control_plane_instance(&self) -> String {
        self.key("instance-id")
    }

    pub fn floating_address(&self) -> String {
        self.key("elastic-ip")
    }

    pub fn floating_address_owner(&self) -> String {
        self.key("elastic-ip/owner")
    }

    pub fn execution_id(&self) -> String {
        self.key("bootstrap/execution-id")
    }

    pub fn step_status(&self) -> String {
        self.key("bootstrap/step-status")
    }

    pub fn golden_image_baseline(&self) -> String {
        self.key("golden-ami/parent-id")
    }
}
