use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Instance tag key carrying the node role. Set at launch, never changed.
pub const ROLE_TAG_KEY: &str = "NodeRole";

/// What a node does in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    MonitoringWorker,
    ApplicationWorker,
}

impl NodeRole {
    pub const ALL: [NodeRole; 3] = [
        NodeRole::ControlPlane,
        NodeRole::MonitoringWorker,
        NodeRole::ApplicationWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::MonitoringWorker => "monitoring-worker",
            Self::ApplicationWorker => "application-worker",
        }
    }

    pub fn is_control_plane(&self) -> bool {
        matches!(self, Self::ControlPlane)
    }

    /// Kubelet node label applied before joining.
    pub fn node_label(&self) -> &'static str {
        match self {
            Self::ControlPlane => "role=control-plane",
            Self::MonitoringWorker => "role=monitoring",
            Self::ApplicationWorker => "role=application",
        }
    }

    /// The `(key, value)` instance tag for this role.
    pub fn tag(&self) -> (&'static str, &'static str) {
        (ROLE_TAG_KEY, self.as_str())
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control-plane" => Ok(Self::ControlPlane),
            "monitoring-worker" | "monitoring" => Ok(Self::MonitoringWorker),
            "application-worker" | "application" | "worker" => Ok(Self::ApplicationWorker),
            other => bail!(
                "Unknown node role {:?} (expected control-plane, monitoring-worker, application-worker)",
                other
            ),
        }
    }
}
