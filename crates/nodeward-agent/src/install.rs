use std::time::Duration;

use anyhow::Result;
use tracing::info;

use nodeward_core::shell::Cmd;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Runs the package installation script on the full-install path.
#[derive(Debug, Clone)]
pub struct PackageInstaller {
    script: Option<String>,
    k8s_version: String,
}

impl PackageInstaller {
    pub fn new(script: Option<&str>, k8s_version: &str) -> Self {
        Self {
            script: script.map(str::to_string),
            k8s_version: k8s_version.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.script.is_some()
    }

    pub async fn install(&self) -> Result<()> {
        let Some(script) = &self.script else {
            anyhow::bail!("Full install required but no [boot].install_script is configured");
        };
        info!(k8s_version = %self.k8s_version, "Installing node packages");
        Cmd::script(script)
            .env("K8S_VERSION", &self.k8s_version)
            .timeout(INSTALL_TIMEOUT)
            .checked()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_passes_version() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("version");
        let script = format!("echo \"$K8S_VERSION\" > {}", out.display());
        PackageInstaller::new(Some(&script), "1.35.1")
            .install()
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "1.35.1");
    }

    #[tokio::test]
    async fn test_install_without_script_fails() {
        let installer = PackageInstaller::new(None, "1.35.1");
        assert!(!installer.is_configured());
        let err = installer.install().await.unwrap_err();
        assert!(err.to_string().contains("install_script"));
    }

    #[tokio::test]
    async fn test_install_script_failure() {
        let err = PackageInstaller::new(Some("exit 7"), "1.35.1")
            .install()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit 7"));
    }
}
