use serde::{Deserialize, Serialize};

use crate::controller::FailoverError;

/// An instance-termination notification.
///
/// Accepts the flat form `{"terminatedInstanceId": "i-1"}` and the
/// EventBridge state-change form `{"detail": {"instance-id": "i-1"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationEvent {
    #[serde(rename = "terminatedInstanceId")]
    pub terminated_instance_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Wire {
    Flat {
        #[serde(rename = "terminatedInstanceId")]
        terminated_instance_id: String,
    },
    EventBridge {
        detail: Detail,
    },
}

#[derive(Deserialize)]
struct Detail {
    #[serde(rename = "instance-id")]
    instance_id: String,
}

impl TerminationEvent {
    pub fn new(instance_id: &str) -> Self {
        Self {
            terminated_instance_id: instance_id.to_string(),
        }
    }

    pub fn parse(json: &str) -> Result<Self, FailoverError> {
        let wire: Wire = serde_json::from_str(json.trim())
            .map_err(|e| FailoverError::InvalidEvent(e.to_string()))?;
        let id = match wire {
            Wire::Flat {
                terminated_instance_id,
            } => terminated_instance_id,
            Wire::EventBridge { detail } => detail.instance_id,
        };
        let id = id.trim();
        if id.is_empty() {
            return Err(FailoverError::InvalidEvent(
                "terminated instance id is empty".into(),
            ));
        }
        Ok(Self::new(id))
    }
}
