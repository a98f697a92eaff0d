use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use nodeward_core::shell::Cmd;

/// A local account that should get its own copy of the admin kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeUser {
    pub name: String,
    pub home: PathBuf,
}

impl KubeUser {
    pub fn new(name: &str, home: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            home: home.into(),
        }
    }

    fn is_root(&self) -> bool {
        self.name == "root"
    }

    fn config_path(&self) -> PathBuf {
        self.home.join(".kube").join("config")
    }
}

/// Copies the admin kubeconfig to operator accounts so `kubectl` works
/// without flags, and exports `KUBECONFIG` for login shells.
///
/// Accounts other than root are skipped until they exist. `ssm-user` is
/// created by the session agent on first login, so a later boot picks it up.
#[derive(Debug, Clone)]
pub struct KubeconfigDistributor {
    admin_conf: PathBuf,
    users: Vec<KubeUser>,
    profile_script: Option<PathBuf>,
}

impl KubeconfigDistributor {
    pub fn new(admin_conf: &Path) -> Self {
        Self {
            admin_conf: admin_conf.to_path_buf(),
            users: vec![
                KubeUser::new("root", "/root"),
                KubeUser::new("ec2-user", "/home/ec2-user"),
                KubeUser::new("ssm-user", "/home/ssm-user"),
            ],
            profile_script: Some(PathBuf::from("/etc/profile.d/kubernetes.sh")),
        }
    }

    pub fn with_users(mut self, users: Vec<KubeUser>) -> Self {
        self.users = users;
        self
    }

    pub fn with_profile_script(mut self, path: Option<&Path>) -> Self {
        self.profile_script = path.map(Path::to_path_buf);
        self
    }

    /// Returns the accounts that were configured.
    pub async fn distribute(&self) -> Result<Vec<String>> {
        if !self.admin_conf.exists() {
            anyhow::bail!("{} does not exist", self.admin_conf.display());
        }

        let mut configured = Vec::new();
        for user in &self.users {
            if !user.is_root() && !account_exists(&user.name).await {
                info!(user = %user.name, "Account not present, skipping kubeconfig");
                continue;
            }
            self.install_for(user).await?;
            configured.push(user.name.clone());
        }

        if let Some(script) = &self.profile_script {
            write_profile_script(script, &self.admin_conf)?;
        }
        info!(users = ?configured, "Kubeconfig distributed");
        Ok(configured)
    }

    async fn install_for(&self, user: &KubeUser) -> Result<()> {
        let target = user.config_path();
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::copy(&self.admin_conf, &target).with_context(|| {
            format!("Failed to copy {} to {}", self.admin_conf.display(), target.display())
        })?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict {}", target.display()))?;

        if !user.is_root() {
            let owner = format!("{0}:{0}", user.name);
            if let Err(e) = Cmd::new("chown")
                .args(["-R", owner.as_str()])
                .arg(user.home.join(".kube").display().to_string())
                .checked()
                .await
            {
                warn!(user = %user.name, error = %format!("{:#}", e), "Failed to hand kubeconfig to user");
            }
        }
        Ok(())
    }
}

async fn account_exists(name: &str) -> bool {
    Cmd::new("id")
        .arg(name)
        .output()
        .await
        .map(|out| out.success())
        .unwrap_or(false)
}

fn profile_line(admin_conf: &Path) -> String {
    format!("export KUBECONFIG={}\n", admin_conf.display())
}

fn write_profile_script(path: &Path, admin_conf: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(path, profile_line(admin_conf))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Failed to set mode on {}", path.display()))
}
