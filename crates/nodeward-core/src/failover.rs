use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The single floating address of a cluster and the instance it currently
/// points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingAddressBinding {
    pub allocation_id: String,
    pub current_owner_instance_id: Option<String>,
    /// Provider handle of the current association, if any.
    #[serde(default)]
    pub association_id: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
}

impl FloatingAddressBinding {
    pub fn unbound(allocation_id: &str) -> Self {
        Self {
            allocation_id: allocation_id.to_string(),
            current_owner_instance_id: None,
            association_id: None,
            public_ip: None,
        }
    }

    pub fn owned_by(allocation_id: &str, instance_id: &str) -> Self {
        Self {
            current_owner_instance_id: Some(instance_id.to_string()),
            ..Self::unbound(allocation_id)
        }
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.current_owner_instance_id.as_deref() == Some(instance_id)
    }
}

/// Provider-reported lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

impl InstanceState {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Tag identifying instances that belong to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTag {
    pub key: String,
    pub value: String,
}

impl MembershipTag {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// What the failover path needs to know about an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl InstanceInfo {
    pub fn new(instance_id: &str, state: InstanceState) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn has_tag(&self, tag: &MembershipTag) -> bool {
        self.tags.get(&tag.key) == Some(&tag.value)
    }

    /// Running and carrying the cluster membership tag.
    pub fn is_healthy_member(&self, tag: &MembershipTag) -> bool {
        self.state == InstanceState::Running && self.has_tag(tag)
    }
}
