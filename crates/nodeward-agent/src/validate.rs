use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// What a pre-baked image must already provide.
#[derive(Debug, Clone)]
pub struct ImageRequirements {
    pub binaries: Vec<String>,
    pub kernel_modules: Vec<String>,
    /// `(key, expected)` with dotted sysctl keys.
    pub sysctls: Vec<(String, String)>,
}

impl Default for ImageRequirements {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            binaries: owned(&["containerd", "kubeadm", "kubelet", "kubectl"]),
            kernel_modules: owned(&["overlay", "br_netfilter"]),
            sysctls: [
                ("net.bridge.bridge-nf-call-iptables", "1"),
                ("net.bridge.bridge-nf-call-ip6tables", "1"),
                ("net.ipv4.ip_forward", "1"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysctlMismatch {
    pub key: String,
    pub expected: String,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub missing_binaries: Vec<String>,
    pub missing_modules: Vec<String>,
    pub sysctl_mismatches: Vec<SysctlMismatch>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty()
            && self.missing_modules.is_empty()
            && self.sysctl_mismatches.is_empty()
    }

    /// One-line description of every miss.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing_binaries.is_empty() {
            parts.push(format!("missing binaries: {}", self.missing_binaries.join(", ")));
        }
        if !self.missing_modules.is_empty() {
            parts.push(format!("modules not loaded: {}", self.missing_modules.join(", ")));
        }
        for m in &self.sysctl_mismatches {
            parts.push(format!(
                "{}={} (want {})",
                m.key,
                m.actual.as_deref().unwrap_or("unset"),
                m.expected
            ));
        }
        parts.join("; ")
    }
}

/// Checks a booted image against [`ImageRequirements`] by inspecting
/// `PATH` and `/proc`.
#[derive(Debug, Clone)]
pub struct ImageValidator {
    requirements: ImageRequirements,
    proc_root: PathBuf,
    search_path: Option<OsString>,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self {
            requirements: ImageRequirements::default(),
            proc_root: PathBuf::from("/proc"),
            search_path: std::env::var_os("PATH"),
        }
    }
}

impl ImageValidator {
    pub fn new(requirements: ImageRequirements) -> Self {
        Self {
            requirements,
            ..Self::default()
        }
    }

    pub fn with_proc_root(mut self, root: &Path) -> Self {
        self.proc_root = root.to_path_buf();
        self
    }

    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        for bin in &self.requirements.binaries {
            match which::which_in(bin, self.search_path.as_ref(), &cwd) {
                Ok(found) => info!(binary = %bin, path = %found.display(), "Binary present"),
                Err(_) => report.missing_binaries.push(bin.clone()),
            }
        }

        let loaded = std::fs::read_to_string(self.proc_root.join("modules")).unwrap_or_default();
        for module in &self.requirements.kernel_modules {
            let present = loaded
                .lines()
                .any(|line| line.split_whitespace().next() == Some(module.as_str()));
            if !present {
                report.missing_modules.push(module.clone());
            }
        }

        for (key, expected) in &self.requirements.sysctls {
            let file = self.proc_root.join("sys").join(key.replace('.', "/"));
            let actual = std::fs::read_to_string(&file)
                .ok()
                .map(|v| v.trim().to_string());
            if actual.as_deref() != Some(expected.as_str()) {
                report.sysctl_mismatches.push(SysctlMismatch {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if report.is_ok() {
            info!("Image validation passed");
        } else {
            warn!(problems = %report.summary(), "Image validation failed");
        }
        report
    }
}
