use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a remote automation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run status as reported by the remote runner. Only the runner moves a
/// run between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A step of the run that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_name: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(step_name: &str, message: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            message: message.to_string(),
        }
    }
}

/// Observed snapshot of a remote automation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationRun {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default)]
    pub step_failures: Vec<StepFailure>,
}

impl AutomationRun {
    /// Short human-readable reason for a non-successful terminal run,
    /// listing every failed step in order.
    pub fn failure_reason(&self) -> String {
        let mut reason = format!("automation run {} finished {}", self.run_id, self.status);
        if !self.step_failures.is_empty() {
            let steps: Vec<String> = self
                .step_failures
                .iter()
                .map(|s| format!("{}: {}", s.step_name, s.message))
                .collect();
            reason.push_str(" (");
            reason.push_str(&steps.join("; "));
            reason.push(')');
        }
        reason
    }
}
