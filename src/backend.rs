//! Production [`BridgeBackend`]: the coordinator's view of both chains.
//!
//! Composes the asset resolver, the validator-set reads, and the relay
//! engine over the live chain clients. The trait itself exists so the
//! coordinator's event-loop logic stays testable against stubs.

use async_trait::async_trait;
use std::sync::Arc;

use crate::chain::unit0::Unit0Client;
use crate::chain::waves::WavesClient;
use crate::coordinator::BridgeBackend;
use crate::relay::{RelayEngine, RelayOutcome};
use crate::resolver::{AssetResolver, Resolution, ResolveError};
use crate::types::{ChainId, TransferEvent, TransferRecord, ValidatorSet};

pub struct Backend {
    unit0: Arc<Unit0Client>,
    waves: Arc<WavesClient>,
    resolver: AssetResolver,
    relay: RelayEngine,
}

impl Backend {
    pub fn new(
        unit0: Arc<Unit0Client>,
        waves: Arc<WavesClient>,
        resolver: AssetResolver,
        relay: RelayEngine,
    ) -> Self {
        Backend {
            unit0,
            waves,
            resolver,
            relay,
        }
    }
}

#[async_trait]
impl BridgeBackend for Backend {
    async fn resolve(&self, event: &TransferEvent) -> Result<Resolution, ResolveError> {
        self.resolver.resolve(event).await
    }

    async fn validator_set(&self, destination: ChainId) -> Result<ValidatorSet, String> {
        match destination {
            ChainId::Unit0(_) => {
                let threshold = self
                    .unit0
                    .validator_threshold()
                    .await
                    .map_err(|e| e.to_string())?;
                let active_count = self
                    .unit0
                    .active_validator_count()
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ValidatorSet {
                    destination,
                    threshold,
                    active_count,
                    // The contract exposes membership as a predicate, not
                    // an enumeration.
                    members: Vec::new(),
                })
            }
            ChainId::Waves(_) => self.waves.validator_set().await.map_err(|e| e.to_string()),
        }
    }

    async fn is_validator(
        &self,
        destination: ChainId,
        validator_id: &str,
    ) -> Result<bool, String> {
        match destination {
            ChainId::Unit0(_) => self
                .unit0
                .is_validator(validator_id)
                .await
                .map_err(|e| e.to_string()),
            ChainId::Waves(_) => {
                let set = self.waves.validator_set().await.map_err(|e| e.to_string())?;
                Ok(set.members.iter().any(|m| m == validator_id))
            }
        }
    }

    async fn relay(
        &self,
        record: &TransferRecord,
        resolution: &Resolution,
        threshold: u32,
    ) -> RelayOutcome {
        self.relay.relay(record, resolution, threshold).await
    }
}
