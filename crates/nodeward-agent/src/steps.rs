use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use nodeward_core::clock::wall_time;
use nodeward_store::{CoordinationStore, PutOptions};

use crate::error::BootError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_name: String,
    pub status: StepState,
    pub started_at: String,
    #[serde(default)]
    pub completed_at: String,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Contents of the local status file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub role: String,
    pub steps: Vec<StepStatus>,
    pub updated_at: String,
}

/// How a step is made idempotent.
#[derive(Debug, Clone)]
pub enum Marker {
    None,
    /// A file the step itself creates, e.g. kubelet.conf after a join.
    Produced(PathBuf),
    /// A file the runner touches after the step succeeds.
    Touch(PathBuf),
}

impl Marker {
    fn path(&self) -> Option<&Path> {
        match self {
            Self::None => None,
            Self::Produced(p) | Self::Touch(p) => Some(p),
        }
    }
}

/// Runs boot steps in order with skip markers, timing, a JSON status
/// file, and best-effort progress records in the coordination store.
pub struct StepRunner<'a> {
    status_file: PathBuf,
    progress: Option<(&'a dyn CoordinationStore, String)>,
    report: StatusReport,
    total: usize,
}

impl<'a> StepRunner<'a> {
    pub fn new(status_file: &Path, role: &str, total: usize) -> Self {
        Self {
            status_file: status_file.to_path_buf(),
            progress: None,
            report: StatusReport {
                role: role.to_string(),
                ..StatusReport::default()
            },
            total,
        }
    }

    /// Also publish per-step progress to `key`.
    pub fn publish_to(mut self, store: &'a dyn CoordinationStore, key: String) -> Self {
        self.progress = Some((store, key));
        self
    }

    pub fn report(&self) -> &StatusReport {
        &self.report
    }

    /// Run one step. Returns `None` when its marker says it already ran.
    pub async fn run<T, F, Fut>(
        &mut self,
        name: &str,
        marker: Marker,
        f: F,
    ) -> Result<Option<T>, BootError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BootError>>,
    {
        let index = self.report.steps.len() + 1;
        let mut status = StepStatus {
            step_name: name.to_string(),
            status: StepState::Running,
            started_at: wall_time(),
            completed_at: String::new(),
            duration_seconds: 0.0,
            error: String::new(),
            details: BTreeMap::new(),
        };

        if let Some(path) = marker.path()
            && path.exists()
        {
            info!(step = name, marker = %path.display(), "Step already done, skipping");
            status.status = StepState::Skipped;
            status.completed_at = wall_time();
            status
                .details
                .insert("marker".to_string(), path.display().to_string());
            self.record(status, index).await;
            return Ok(None);
        }

        info!(step = name, index, total = self.total, "Step starting");
        self.report.steps.push(status.clone());
        self.write_status_file();

        let start = Instant::now();
        let result = f().await;
        let result = match (result, &marker) {
            (Ok(value), Marker::Touch(path)) => touch(path).map(|_| value).map_err(BootError::from),
            (r, _) => r,
        };
        self.report.steps.pop();

        status.duration_seconds = start.elapsed().as_secs_f64();
        status.completed_at = wall_time();
        match &result {
            Ok(_) => {
                status.status = StepState::Success;
                info!(step = name, duration_secs = status.duration_seconds, "Step succeeded");
            }
            Err(e) => {
                status.status = StepState::Failed;
                status.error = e.to_string();
                error!(step = name, error = %e, "Step failed");
            }
        }
        self.record(status, index).await;
        result.map(Some)
    }

    async fn record(&mut self, status: StepStatus, index: usize) {
        let progress = serde_json::json!({
            "step": status.step_name,
            "index": index,
            "total": self.total,
            "status": status.status,
            "duration": status.duration_seconds,
        });
        self.report.steps.push(status);
        self.write_status_file();

        if let Some((store, key)) = &self.progress
            && let Err(e) = store
                .put(key, &progress.to_string(), PutOptions::plain())
                .await
        {
            warn!(key = %key, error = %e, "Failed to publish step status");
        }
    }

    fn write_status_file(&mut self) {
        self.report.updated_at = wall_time();
        let result = serde_json::to_string_pretty(&self.report)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                if let Some(dir) = self.status_file.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&self.status_file, json)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(file = %self.status_file.display(), error = %e, "Failed to write status file");
        }
    }
}

fn touch(path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(path, wall_time()).with_context(|| format!("Failed to write marker {}", path.display()))
}
