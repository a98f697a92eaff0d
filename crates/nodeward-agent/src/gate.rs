use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use nodeward_core::clock::wall_time;
use nodeward_core::naming::StorePaths;
use nodeward_store::CoordinationStore;

const DECISION_FILE: &str = "install-path.json";

/// Which filesystem layout the rest of boot assumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallPath {
    /// Software is baked into the image; validate, never install.
    PreBaked,
    /// Install packages before joining.
    FullInstall,
}

impl fmt::Display for InstallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreBaked => "pre-baked",
            Self::FullInstall => "full-install",
        })
    }
}

/// A persisted gate decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub path: InstallPath,
    pub image_id: String,
    pub baseline: Option<String>,
    pub decided_at: String,
}

/// A golden image differs from the parent image it was baked from. A match,
/// or an unknown baseline, means a stock image that needs installing.
pub fn decide(image_id: &str, baseline: Option<&str>) -> InstallPath {
    match baseline {
        Some(parent) if !parent.is_empty() && parent != image_id => InstallPath::PreBaked,
        _ => InstallPath::FullInstall,
    }
}

/// Boot-time branch between the pre-baked and full-install paths.
///
/// Decides once and persists the result under the state dir so a re-run
/// of boot on the same instance never switches paths halfway.
pub struct GoldenImageGate<'a> {
    store: &'a dyn CoordinationStore,
    paths: &'a StorePaths,
    state_dir: PathBuf,
}

impl<'a> GoldenImageGate<'a> {
    pub fn new(store: &'a dyn CoordinationStore, paths: &'a StorePaths, state_dir: &Path) -> Self {
        Self {
            store,
            paths,
            state_dir: state_dir.to_path_buf(),
        }
    }

    fn decision_file(&self) -> PathBuf {
        self.state_dir.join(DECISION_FILE)
    }

    /// Previously persisted decision, if any.
    pub fn persisted(&self) -> Result<Option<GateDecision>> {
        let path = self.decision_file();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let decision = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt gate decision in {}", path.display()))?;
        Ok(Some(decision))
    }

    pub async fn evaluate(&self, image_id: &str) -> Result<GateDecision> {
        if let Some(decision) = self.persisted()? {
            info!(path = %decision.path, image_id = %decision.image_id, "Reusing install path decision");
            return Ok(decision);
        }

        let baseline_key = self.paths.golden_image_baseline();
        let baseline = match self.store.try_get(&baseline_key).await {
            Ok(v) => v.map(|s| s.trim().to_string()),
            Err(e) => {
                warn!(key = %baseline_key, error = %e, "Baseline image unreadable, assuming unknown");
                None
            }
        };

        let decision = GateDecision {
            path: decide(image_id, baseline.as_deref()),
            image_id: image_id.to_string(),
            baseline,
            decided_at: wall_time(),
        };
        info!(
            path = %decision.path,
            image_id,
            baseline = decision.baseline.as_deref().unwrap_or("unknown"),
            "Install path decided"
        );
        self.persist(&decision)?;
        Ok(decision)
    }

    fn persist(&self, decision: &GateDecision) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Failed to create {}", self.state_dir.display()))?;
        let path = self.decision_file();
        let json = serde_json::to_string_pretty(decision)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}
