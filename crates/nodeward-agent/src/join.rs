use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use nodeward_core::clock::Clock;
use nodeward_core::join::JoinMaterials;
use nodeward_core::poll::{Attempt, Poller};
use nodeward_core::role::NodeRole;
use nodeward_core::shell::Cmd;

/// Joins this node to a cluster. Called at most once per boot.
#[async_trait]
pub trait JoinExecutor: Send + Sync {
    async fn join(&self, materials: &JoinMaterials, role: NodeRole) -> Result<()>;

    /// Whether kubelet came up after a successful join. A slow kubelet is
    /// logged, not fatal.
    async fn wait_for_kubelet(&self, _clock: &dyn Clock) -> bool {
        true
    }
}

/// `kubeadm join` with the node-role label pre-seeded into kubelet's
/// extra args.
#[derive(Debug, Clone)]
pub struct KubeadmJoin {
    kubelet_env: PathBuf,
    timeout: Duration,
}

impl KubeadmJoin {
    pub fn new(timeout: Duration) -> Self {
        Self {
            kubelet_env: PathBuf::from("/etc/sysconfig/kubelet"),
            timeout,
        }
    }

    pub fn with_kubelet_env(mut self, path: &Path) -> Self {
        self.kubelet_env = path.to_path_buf();
        self
    }

    fn write_kubelet_env(&self, role: NodeRole) -> Result<()> {
        if let Some(dir) = self.kubelet_env.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::write(&self.kubelet_env, kubelet_extra_args(role))
            .with_context(|| format!("Failed to write {}", self.kubelet_env.display()))
    }
}

fn kubelet_extra_args(role: NodeRole) -> String {
    format!("KUBELET_EXTRA_ARGS=--node-labels={}\n", role.node_label())
}

#[async_trait]
impl JoinExecutor for KubeadmJoin {
    async fn join(&self, materials: &JoinMaterials, role: NodeRole) -> Result<()> {
        self.write_kubelet_env(role)?;
        info!(endpoint = %materials.endpoint, role = %role, "Running kubeadm join");
        Cmd::new("kubeadm")
            .args(["join", &materials.endpoint.to_string(), "--token"])
            .secret(materials.token.expose())
            .args([
                "--discovery-token-ca-cert-hash",
                materials.ca_fingerprint.as_str(),
            ])
            .timeout(self.timeout)
            .checked()
            .await?;
        Ok(())
    }

    /// Polls `systemctl is-active kubelet` once a second for up to 60s.
    async fn wait_for_kubelet(&self, clock: &dyn Clock) -> bool {
        let result = Poller::new(clock, "kubelet", Duration::from_secs(1))
            .max_attempts(60)
            .run(|_| async {
                match Cmd::new("systemctl")
                    .args(["is-active", "--quiet", "kubelet"])
                    .output()
                    .await
                {
                    Ok(out) if out.success() => Attempt::Ready(()),
                    Ok(out) => Attempt::Retry(format!("systemctl exit {}", out.code)),
                    Err(e) => Attempt::<(), anyhow::Error>::Retry(e.to_string()),
                }
            })
            .await;
        match result {
            Ok(polled) => {
                info!(waited_secs = polled.attempts, "kubelet is active");
                true
            }
            Err(e) => {
                let journal = Cmd::new("journalctl")
                    .args(["-u", "kubelet", "--no-pager", "-n", "20"])
                    .output()
                    .await
                    .map(|out| out.stdout)
                    .unwrap_or_default();
                warn!(error = %e, journal = %journal, "kubelet did not become active");
                false
            }
        }
    }
}
