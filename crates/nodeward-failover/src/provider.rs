use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;

use nodeward_core::failover::{FloatingAddressBinding, InstanceInfo, InstanceState, MembershipTag};

/// Compute API operations the failover path needs.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Current association of the floating address.
    async fn describe_binding(&self, allocation_id: &str) -> Result<FloatingAddressBinding>;

    /// `None` when the provider no longer knows the instance.
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>>;

    /// Running instances carrying `tag`, in discovery order.
    async fn list_members(&self, tag: &MembershipTag) -> Result<Vec<InstanceInfo>>;

    async fn disassociate(&self, association_id: &str) -> Result<()>;

    /// Point the address at `instance_id`, replacing any association.
    /// Returns the new association id.
    async fn associate(&self, allocation_id: &str, instance_id: &str) -> Result<String>;
}

#[derive(Debug, Default)]
struct Inner {
    instances: Vec<InstanceInfo>,
    bindings: BTreeMap<String, FloatingAddressBinding>,
    calls: Vec<String>,
    next_association: u32,
}

/// In-process provider for tests and local runs.
///
/// Instances keep insertion order, which is also their discovery order.
#[derive(Debug, Default)]
pub struct MemoryComputeProvider {
    inner: Mutex<Inner>,
}

impl MemoryComputeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, instance: InstanceInfo) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.instances.push(instance);
        }
        self
    }

    pub fn with_binding(self, binding: FloatingAddressBinding) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            let mut binding = binding;
            if binding.current_owner_instance_id.is_some() && binding.association_id.is_none() {
                inner.next_association += 1;
                binding.association_id = Some(format!("eipassoc-{}", inner.next_association));
            }
            inner.bindings.insert(binding.allocation_id.clone(), binding);
        }
        self
    }

    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Ok(mut inner) = self.inner.lock()
            && let Some(i) = inner
                .instances
                .iter_mut()
                .find(|i| i.instance_id == instance_id)
        {
            i.state = state;
        }
    }

    pub fn binding(&self, allocation_id: &str) -> Option<FloatingAddressBinding> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.bindings.get(allocation_id).cloned())
    }

    /// Mutating calls made so far, e.g. `associate A1 i-2`.
    pub fn calls(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ComputeProvider for MemoryComputeProvider {
    async fn describe_binding(&self, allocation_id: &str) -> Result<FloatingAddressBinding> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("provider state poisoned"))?;
        match inner.bindings.get(allocation_id) {
            Some(b) => Ok(b.clone()),
            None => bail!("No floating address with allocation id {}", allocation_id),
        }
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("provider state poisoned"))?;
        Ok(inner
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned())
    }

    async fn list_members(&self, tag: &MembershipTag) -> Result<Vec<InstanceInfo>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("provider state poisoned"))?;
        Ok(inner
            .instances
            .iter()
            .filter(|i| i.is_healthy_member(tag))
            .cloned()
            .collect())
    }

    async fn disassociate(&self, association_id: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("provider state poisoned"))?;
        inner.calls.push(format!("disassociate {}", association_id));
        for binding in inner.bindings.values_mut() {
            if binding.association_id.as_deref() == Some(association_id) {
                binding.association_id = None;
                binding.current_owner_instance_id = None;
            }
        }
        Ok(())
    }

    async fn associate(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("provider state poisoned"))?;
        inner
            .calls
            .push(format!("associate {} {}", allocation_id, instance_id));
        inner.next_association += 1;
        let association_id = format!("eipassoc-{}", inner.next_association);
        let Some(binding) = inner.bindings.get_mut(allocation_id) else {
            bail!("No floating address with allocation id {}", allocation_id);
        };
        if binding.is_owned_by(instance_id)
            && let Some(existing) = &binding.association_id
        {
            return Ok(existing.clone());
        }
        binding.current_owner_instance_id = Some(instance_id.to_string());
        binding.association_id = Some(association_id.clone());
        Ok(association_id)
    }
}
