use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use nodeward_core::failover::MembershipTag;
use nodeward_store::{CoordinationStore, PutOptions};

use crate::event::TerminationEvent;
use crate::provider::ComputeProvider;

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    /// No running tagged instance is left to take the address. Retrying
    /// cannot help until new capacity exists.
    #[error("no healthy candidate for {allocation_id} after {terminated} terminated")]
    NoHealthyCandidate {
        allocation_id: String,
        terminated: String,
    },
    #[error("compute provider error: {0}")]
    Provider(String),
    #[error("invalid termination event: {0}")]
    InvalidEvent(String),
}

impl FailoverError {
    fn provider(e: anyhow::Error) -> Self {
        Self::Provider(format!("{:#}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailoverOutcome {
    /// The address already points at a healthy instance other than the
    /// terminated one.
    Unaffected { owner: String },
    Reassigned { from: Option<String>, to: String },
}

/// Keeps the cluster's floating address on a healthy member.
///
/// Read-then-write with no lock: two triggers for the same termination may
/// both reassociate, and the provider's reassociation is last-writer-wins.
#[derive(Clone)]
pub struct FailoverController {
    provider: Arc<dyn ComputeProvider>,
    allocation_id: String,
    tag: MembershipTag,
    owner_record: Option<(Arc<dyn CoordinationStore>, String)>,
}

impl FailoverController {
    pub fn new(provider: Arc<dyn ComputeProvider>, allocation_id: &str, tag: MembershipTag) -> Self {
        Self {
            provider,
            allocation_id: allocation_id.to_string(),
            tag,
            owner_record: None,
        }
    }

    /// Also write the new owner's instance id to `key` after a reassignment.
    pub fn record_owner_to(mut self, store: Arc<dyn CoordinationStore>, key: String) -> Self {
        self.owner_record = Some((store, key));
        self
    }

    pub async fn handle(&self, event: &TerminationEvent) -> Result<FailoverOutcome, FailoverError> {
        let terminated = event.terminated_instance_id.as_str();
        let binding = self
            .provider
            .describe_binding(&self.allocation_id)
            .await
            .map_err(FailoverError::provider)?;

        if let Some(owner) = binding.current_owner_instance_id.as_deref()
            && owner != terminated
        {
            let healthy = self
                .provider
                .describe_instance(owner)
                .await
                .map_err(FailoverError::provider)?
                .is_some_and(|i| i.is_healthy_member(&self.tag));
            if healthy {
                info!(
                    allocation_id = %self.allocation_id,
                    owner,
                    terminated,
                    "Floating address unaffected by termination"
                );
                return Ok(FailoverOutcome::Unaffected {
                    owner: owner.to_string(),
                });
            }
            warn!(owner, "Current floating address owner is not healthy");
        }

        let candidates = self
            .provider
            .list_members(&self.tag)
            .await
            .map_err(FailoverError::provider)?;
        let Some(target) = candidates
            .into_iter()
            .find(|i| i.instance_id != terminated && i.is_healthy_member(&self.tag))
        else {
            error!(
                allocation_id = %self.allocation_id,
                terminated,
                "No healthy candidate for floating address"
            );
            return Err(FailoverError::NoHealthyCandidate {
                allocation_id: self.allocation_id.clone(),
                terminated: terminated.to_string(),
            });
        };

        if let Some(association_id) = &binding.association_id {
            self.provider
                .disassociate(association_id)
                .await
                .map_err(FailoverError::provider)?;
        }
        self.provider
            .associate(&self.allocation_id, &target.instance_id)
            .await
            .map_err(FailoverError::provider)?;
        info!(
            allocation_id = %self.allocation_id,
            from = binding.current_owner_instance_id.as_deref().unwrap_or("none"),
            to = %target.instance_id,
            "Floating address reassigned"
        );

        self.record_owner(&target.instance_id).await;
        Ok(FailoverOutcome::Reassigned {
            from: binding.current_owner_instance_id,
            to: target.instance_id,
        })
    }

    async fn record_owner(&self, instance_id: &str) {
        if let Some((store, key)) = &self.owner_record
            && let Err(e) = store.put(key, instance_id, PutOptions::plain()).await
        {
            warn!(key = %key, error = %e, "Failed to record floating address owner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeward_core::failover::{FloatingAddressBinding, InstanceInfo, InstanceState};
    use nodeward_store::memory::MemoryStore;

    use crate::provider::MemoryComputeProvider;

    const OWNER_KEY: &str = "/k8s/development/elastic-ip/owner";

    fn tag() -> MembershipTag {
        MembershipTag::new("Cluster", "k8s-development")
    }

    fn member(id: &str) -> InstanceInfo {
        InstanceInfo::new(id, InstanceState::Running).with_tag("Cluster", "k8s-development")
    }

    fn controller(provider: &Arc<MemoryComputeProvider>, store: &Arc<MemoryStore>) -> FailoverController {
        FailoverController::new(provider.clone(), "A1", tag())
            .record_owner_to(store.clone(), OWNER_KEY.to_string())
    }

    #[tokio::test]
    async fn test_owner_terminated_reassigns_to_first_candidate() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-1"))
                .with_instance(member("i-2"))
                .with_instance(member("i-3")),
        );
        let store = Arc::new(MemoryStore::new());

        let outcome = controller(&provider, &store)
            .handle(&TerminationEvent::new("i-1"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FailoverOutcome::Reassigned {
                from: Some("i-1".into()),
                to: "i-2".into()
            }
        );
        assert!(provider.binding("A1").unwrap().is_owned_by("i-2"));
        assert_eq!(store.get(OWNER_KEY).await.unwrap(), "i-2");
    }

    #[tokio::test]
    async fn test_no_candidate_leaves_binding_stale() {
        let provider = Arc::new(
            MemoryComputeProvider::new().with_binding(FloatingAddressBinding::owned_by("A1", "i-1")),
        );
        let store = Arc::new(MemoryStore::new());
        let before = provider.binding("A1").unwrap();

        let err = controller(&provider, &store)
            .handle(&TerminationEvent::new("i-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, FailoverError::NoHealthyCandidate { .. }));
        assert_eq!(provider.binding("A1").unwrap(), before);
        assert!(provider.calls().is_empty());
        assert!(store.try_get(OWNER_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminated_instance_is_never_a_candidate() {
        // Termination events can arrive before the provider stops listing
        // the instance as running.
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-1"))
                .with_instance(member("i-1")),
        );
        let store = Arc::new(MemoryStore::new());
        let err = controller(&provider, &store)
            .handle(&TerminationEvent::new("i-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::NoHealthyCandidate { .. }));
    }

    #[tokio::test]
    async fn test_second_invocation_is_noop() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-1"))
                .with_instance(member("i-2"))
                .with_instance(member("i-3")),
        );
        let store = Arc::new(MemoryStore::new());
        let controller = controller(&provider, &store);
        let event = TerminationEvent::new("i-1");

        controller.handle(&event).await.unwrap();
        let after_first = provider.binding("A1").unwrap();
        let calls_after_first = provider.calls().len();

        let second = controller.handle(&event).await.unwrap();
        assert_eq!(second, FailoverOutcome::Unaffected { owner: "i-2".into() });
        assert_eq!(provider.binding("A1").unwrap(), after_first);
        assert_eq!(provider.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_unrelated_termination_leaves_binding() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-2"))
                .with_instance(member("i-2"))
                .with_instance(member("i-3")),
        );
        let store = Arc::new(MemoryStore::new());
        let before = provider.binding("A1").unwrap();

        let outcome = controller(&provider, &store)
            .handle(&TerminationEvent::new("i-3"))
            .await
            .unwrap();
        assert_eq!(outcome, FailoverOutcome::Unaffected { owner: "i-2".into() });
        assert_eq!(provider.binding("A1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_unhealthy_owner_is_replaced() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-2"))
                .with_instance(member("i-2"))
                .with_instance(member("i-3")),
        );
        provider.set_state("i-2", InstanceState::Stopped);
        let store = Arc::new(MemoryStore::new());

        let outcome = controller(&provider, &store)
            .handle(&TerminationEvent::new("i-9"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailoverOutcome::Reassigned {
                from: Some("i-2".into()),
                to: "i-3".into()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_terminations_settle_on_one_healthy_owner() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-1"))
                .with_instance(member("i-1"))
                .with_instance(member("i-2"))
                .with_instance(member("i-3"))
                .with_instance(member("i-4")),
        );
        provider.set_state("i-1", InstanceState::ShuttingDown);
        provider.set_state("i-2", InstanceState::ShuttingDown);
        let store = Arc::new(MemoryStore::new());
        let controller = controller(&provider, &store);

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.handle(&TerminationEvent::new("i-1")).await }
        });
        let second = tokio::spawn({
            let controller = controller.clone();
            async move { controller.handle(&TerminationEvent::new("i-2")).await }
        });
        let (first, second) = tokio::join!(first, second);
        first.unwrap().unwrap();
        second.unwrap().unwrap();

        let binding = provider.binding("A1").unwrap();
        let owner = binding.current_owner_instance_id.clone().unwrap();
        assert!(owner == "i-3" || owner == "i-4", "owner was {}", owner);
        assert!(binding.association_id.is_some());
        let owner_info = provider.describe_instance(&owner).await.unwrap().unwrap();
        assert!(owner_info.is_healthy_member(&tag()));

        // A follow-up for either termination finds nothing left to do.
        for terminated in ["i-1", "i-2"] {
            let outcome = controller.handle(&TerminationEvent::new(terminated)).await.unwrap();
            assert_eq!(outcome, FailoverOutcome::Unaffected { owner: owner.clone() });
        }
    }

    struct ReadOnlyStore;

    #[async_trait::async_trait]
    impl CoordinationStore for ReadOnlyStore {
        async fn get(&self, path: &str) -> Result<String, nodeward_store::StoreError> {
            Err(nodeward_store::StoreError::NotFound(path.to_string()))
        }

        async fn put(&self, path: &str, _: &str, _: PutOptions) -> Result<(), nodeward_store::StoreError> {
            Err(nodeward_store::StoreError::AccessDenied(path.to_string()))
        }

        async fn get_with_prefix(
            &self,
            _: &str,
        ) -> Result<Vec<nodeward_store::Entry>, nodeward_store::StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_owner_record_failure_is_not_fatal() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::owned_by("A1", "i-1"))
                .with_instance(member("i-2")),
        );
        let result = FailoverController::new(provider.clone(), "A1", tag())
            .record_owner_to(Arc::new(ReadOnlyStore), OWNER_KEY.to_string())
            .handle(&TerminationEvent::new("i-1"))
            .await;
        assert!(result.is_ok());
        assert!(provider.binding("A1").unwrap().is_owned_by("i-2"));
    }

    #[tokio::test]
    async fn test_unbound_address_is_claimed() {
        let provider = Arc::new(
            MemoryComputeProvider::new()
                .with_binding(FloatingAddressBinding::unbound("A1"))
                .with_instance(member("i-2")),
        );
        let outcome = FailoverController::new(provider.clone(), "A1", tag())
            .handle(&TerminationEvent::new("i-1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailoverOutcome::Reassigned {
                from: None,
                to: "i-2".into()
            }
        );
        assert_eq!(provider.calls(), vec!["associate A1 i-2"]);
    }
}
