use std::time::Duration;

use anyhow::Context;
use tracing::info;

use nodeward_core::clock::Clock;
use nodeward_core::join::{ControlPlaneEndpoint, JoinMaterials, JoinToken, MaterialEnvelope};
use nodeward_core::naming::StorePaths;
use nodeward_core::retry::retry;
use nodeward_store::{CoordinationStore, PutOptions, StoreError};

use crate::control_plane::ControlPlane;
use crate::error::BootError;

const PUBLISH_ATTEMPTS: u32 = 5;
const PUBLISH_BASE_DELAY: Duration = Duration::from_secs(2);

/// Non-secret facts about the control plane published next to the join
/// materials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlPlaneRecords {
    pub instance_id: String,
    pub floating_address: Option<String>,
}

/// Writes join materials for the control plane this node runs.
///
/// Each rotation gets a fresh generation id stamped on all three values,
/// so a consumer can tell a complete set from one caught mid-rotation.
pub struct JoinPublisher<'a> {
    store: &'a dyn CoordinationStore,
    paths: &'a StorePaths,
    clock: &'a dyn Clock,
}

struct Write {
    path: String,
    value: String,
    opts: PutOptions,
}

impl<'a> JoinPublisher<'a> {
    pub fn new(store: &'a dyn CoordinationStore, paths: &'a StorePaths, clock: &'a dyn Clock) -> Self {
        Self { store, paths, clock }
    }

    /// Generate a token, register it with the control plane, and publish a
    /// new generation of materials. Returns the generation id.
    pub async fn rotate(
        &self,
        control_plane: &dyn ControlPlane,
        endpoint: ControlPlaneEndpoint,
        records: &ControlPlaneRecords,
    ) -> Result<String, BootError> {
        let token = JoinToken::generate();
        control_plane.register_token(&token).await?;
        let ca_fingerprint = control_plane.ca_fingerprint().await?;
        let materials = JoinMaterials {
            token,
            ca_fingerprint,
            endpoint,
        };
        self.publish(&materials, records).await
    }

    /// Write `materials` and `records` as one generation.
    pub async fn publish(
        &self,
        materials: &JoinMaterials,
        records: &ControlPlaneRecords,
    ) -> Result<String, BootError> {
        let generation = MaterialEnvelope::new_generation();
        let envelope = |value: &str| {
            MaterialEnvelope::new(&generation, value)
                .encode()
                .context("Failed to encode join material")
        };

        let mut writes = vec![
            Write {
                path: self.paths.join_token(),
                value: envelope(materials.token.expose())?,
                opts: PutOptions::secure(),
            },
            Write {
                path: self.paths.ca_fingerprint(),
                value: envelope(materials.ca_fingerprint.as_str())?,
                opts: PutOptions::plain(),
            },
            Write {
                path: self.paths.control_plane_endpoint(),
                value: envelope(&materials.endpoint.to_string())?,
                opts: PutOptions::plain(),
            },
            Write {
                path: self.paths.control_plane_instance(),
                value: records.instance_id.clone(),
                opts: PutOptions::plain(),
            },
        ];
        if let Some(address) = &records.floating_address {
            writes.push(Write {
                path: self.paths.floating_address(),
                value: address.clone(),
                opts: PutOptions::plain(),
            });
        }

        retry(
            self.clock,
            PUBLISH_ATTEMPTS,
            PUBLISH_BASE_DELAY,
            "Publish join materials",
            || async {
                for w in &writes {
                    self.store.put(&w.path, &w.value, w.opts).await?;
                }
                Ok::<(), anyhow::Error>(())
            },
        )
        .await?;

        info!(
            generation = %generation,
            endpoint = %materials.endpoint,
            prefix = self.paths.prefix(),
            "Join materials published"
        );
        Ok(generation)
    }

    /// The complete, consistent set currently in the store, if any.
    pub async fn current(&self) -> Result<Option<JoinMaterials>, BootError> {
        let mut raw = Vec::with_capacity(3);
        for path in [
            self.paths.join_token(),
            self.paths.ca_fingerprint(),
            self.paths.control_plane_endpoint(),
        ] {
            match self.store.get(&path).await {
                Ok(v) => raw.push(MaterialEnvelope::decode(&v)),
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(JoinMaterials::from_envelopes(&raw[0], &raw[1], &raw[2]).ok())
    }
}
