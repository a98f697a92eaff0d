use nodeward_core::clock::DeadlineExceeded;
use nodeward_core::join::MaterialsError;
use nodeward_store::StoreError;

/// Everything that can make a node's boot fail.
///
/// The `Display` form of each variant is the short reason sent with the
/// failure signal, so keep messages to one line.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("join materials not found after {attempts} attempts: {last}")]
    MaterialsNotFound { attempts: u32, last: String },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid join materials: {0}")]
    InvalidMaterials(#[from] MaterialsError),
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
    #[error("join failed: {0}")]
    JoinFailed(String),
    #[error("{0}")]
    AutomationFailed(String),
    #[error("image validation failed: {0}")]
    ValidationFailed(String),
    #[error("step {step} failed: {message}")]
    Step { step: String, message: String },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for BootError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AccessDenied(msg) => Self::AccessDenied(msg),
            other => Self::Store(other),
        }
    }
}

impl BootError {
    pub fn step(step: &str, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.to_string(),
            message: message.into(),
        }
    }
}
