use std::time::Duration;

use tracing::{info, warn};

use nodeward_core::clock::{Clock, Deadline};
use nodeward_core::join::{JoinMaterials, MaterialEnvelope, MaterialsError};
use nodeward_core::naming::StorePaths;
use nodeward_core::poll::{Attempt, PollError, Poller};
use nodeward_store::{CoordinationStore, StoreError};

use crate::error::BootError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(20);

/// Discovers join materials published by the control plane.
///
/// Polls all three paths on a fixed interval until a complete set from a
/// single rotation is visible. `NotFound` and a mixed-generation read are
/// retried; `AccessDenied` and malformed values stop immediately. Nothing
/// partial is ever returned.
pub struct JoinConsumer<'a> {
    store: &'a dyn CoordinationStore,
    paths: &'a StorePaths,
    clock: &'a dyn Clock,
    max_attempts: u32,
    interval: Duration,
    deadline: Deadline,
}

impl<'a> JoinConsumer<'a> {
    pub fn new(store: &'a dyn CoordinationStore, paths: &'a StorePaths, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            paths,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_RETRY_INTERVAL,
            deadline: Deadline::none(),
        }
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn fetch(&self) -> Result<JoinMaterials, BootError> {
        info!(
            max_attempts = self.max_attempts,
            interval_secs = self.interval.as_secs(),
            prefix = self.paths.prefix(),
            "Waiting for join materials"
        );
        let result = Poller::new(self.clock, "join materials", self.interval)
            .max_attempts(self.max_attempts)
            .deadline(self.deadline)
            .run(|attempt| self.read_once(attempt))
            .await;

        match result {
            Ok(polled) => {
                info!(attempts = polled.attempts, endpoint = %polled.value.endpoint, "Join materials found");
                Ok(polled.value)
            }
            Err(PollError::Exhausted { attempts, last }) => {
                warn!(attempts, last = %last, "Join materials never appeared");
                Err(BootError::MaterialsNotFound { attempts, last })
            }
            Err(PollError::Deadline(e)) => Err(BootError::Deadline(e)),
            Err(PollError::Fatal(e)) => Err(e),
        }
    }

    async fn read_once(&self, attempt: u32) -> Attempt<JoinMaterials, BootError> {
        let mut envelopes = Vec::with_capacity(3);
        for (name, path) in [
            ("join-token", self.paths.join_token()),
            ("ca-hash", self.paths.ca_fingerprint()),
            ("control-plane-endpoint", self.paths.control_plane_endpoint()),
        ] {
            match self.store.get(&path).await {
                Ok(raw) => envelopes.push(MaterialEnvelope::decode(&raw)),
                Err(StoreError::NotFound(_)) => {
                    return Attempt::Retry(format!("{} not published", name));
                }
                Err(StoreError::AccessDenied(msg)) => {
                    return Attempt::Fatal(BootError::AccessDenied(msg));
                }
                Err(e @ StoreError::Crypto(_)) => return Attempt::Fatal(e.into()),
                Err(e) => {
                    warn!(attempt, path = %path, error = %e, "Store read failed");
                    return Attempt::Retry(e.to_string());
                }
            }
        }

        match JoinMaterials::from_envelopes(&envelopes[0], &envelopes[1], &envelopes[2]) {
            Ok(materials) => Attempt::Ready(materials),
            Err(e @ MaterialsError::MixedGenerations(_)) => {
                info!(attempt, "Join materials mid-rotation, waiting");
                Attempt::Retry(e.to_string())
            }
            Err(e) => Attempt::Fatal(BootError::InvalidMaterials(e)),
        }
    }
}
