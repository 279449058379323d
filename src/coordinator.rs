//! The coordinator: single owner of transfer-record state.
//!
//! Every inbound path funnels into one bounded queue — watcher events,
//! peer envelopes, watcher faults — and one task drains it. The
//! coordinator inserts records, asks the signing engine for our
//! attestation, publishes it, folds peer attestations in, and drives
//! records to the relay engine once the destination bridge's quorum is
//! met. It is the only component that mutates a record's status.
//!
//! Persistence-before-acknowledgement is the rule throughout: a crash at
//! any point leaves the store able to re-derive the remaining workflow on
//! restart, which the startup pass and the periodic sweep then do.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::gossip::{Announce, Envelope, EnvelopeBody, GossipHandle};
use crate::relay::RelayOutcome;
use crate::resolver::{Resolution, ResolveError};
use crate::signing::SigningEngine;
use crate::store::{Store, StoreError};
use crate::types::{
    Attestation, ChainId, RecordError, TransferEvent, TransferRecord, TransferStatus, UnixMillis,
    ValidatorSet,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const THRESHOLD_TTL: Duration = Duration::from_secs(30);
const MAX_RELAY_ATTEMPTS: u32 = 5;

/// Everything that can arrive on the coordinator's queue.
#[derive(Debug)]
pub enum NodeEvent {
    /// A lock event from one of our own watchers.
    Observed(TransferEvent),
    /// A lock event relayed by a peer over gossip.
    PeerTransfer(TransferEvent),
    /// A peer's attestation over gossip.
    PeerAttestation(Attestation),
    /// A peer liveness beacon.
    PeerAnnounce(Announce),
    /// A watcher exhausted its retries; non-fatal.
    WatcherFault { chain: ChainId, detail: String },
    /// Unrecoverable failure (persistence); tears the process down.
    Fatal(String),
}

/// Destination-chain capabilities the coordinator needs, abstracted so the
/// event-loop logic is testable without live chains.
#[async_trait]
pub trait BridgeBackend: Send + Sync + 'static {
    async fn resolve(&self, event: &TransferEvent) -> Result<Resolution, ResolveError>;
    async fn validator_set(&self, destination: ChainId) -> Result<ValidatorSet, String>;
    async fn is_validator(&self, destination: ChainId, validator_id: &str)
    -> Result<bool, String>;
    async fn relay(
        &self,
        record: &TransferRecord,
        resolution: &Resolution,
        threshold: u32,
    ) -> RelayOutcome;
}

/// Snapshot state shared with the status HTTP surface.
#[derive(Debug)]
pub struct NodeStatus {
    pub started_at: UnixMillis,
    pub unit0_validator_id: String,
    pub waves_validator_id: Option<String>,
    pub last_fault: RwLock<Option<RecordError>>,
    pub validator_sets: RwLock<Vec<ValidatorSet>>,
}

impl NodeStatus {
    pub fn new(unit0_validator_id: String, waves_validator_id: Option<String>) -> Self {
        NodeStatus {
            started_at: UnixMillis::now(),
            unit0_validator_id,
            waves_validator_id,
            last_fault: RwLock::new(None),
            validator_sets: RwLock::new(Vec::new()),
        }
    }
}

pub struct Coordinator<B: BridgeBackend> {
    store: Store,
    signing: Arc<SigningEngine>,
    backend: Arc<B>,
    gossip: Option<GossipHandle>,
    status: Arc<NodeStatus>,
    cancel: CancellationToken,
    thresholds: HashMap<&'static str, (u32, Instant)>,
}

impl<B: BridgeBackend> Coordinator<B> {
    pub fn new(
        store: Store,
        signing: Arc<SigningEngine>,
        backend: Arc<B>,
        gossip: Option<GossipHandle>,
        status: Arc<NodeStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Coordinator {
            store,
            signing,
            backend,
            gossip,
            status,
            cancel,
            thresholds: HashMap::new(),
        }
    }

    /// Drain the queue until cancellation. Returns `Err` only on fatal
    /// (persistence-class) failures; the caller turns that into exit 2.
    pub async fn run(mut self, mut events: mpsc::Receiver<NodeEvent>) -> Result<(), String> {
        self.recover_open_records().await.map_err(fatal)?;

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let cancel = self.cancel.clone();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = events.recv() => {
                    match event {
                        Some(NodeEvent::Fatal(detail)) => break Err(detail),
                        Some(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                break Err(e.to_string());
                            }
                        }
                        None => break Ok(()),
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep().await {
                        break Err(e.to_string());
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        };
        // Stop the other tasks, then make the store durable.
        self.cancel.cancel();
        self.store.flush().map_err(fatal)?;
        tracing::info!("Coordinator stopped");
        result
    }

    /// Re-derive pending work from the store after a restart.
    async fn recover_open_records(&mut self) -> Result<(), StoreError> {
        let open = self.store.list_open_transfers()?;
        if open.is_empty() {
            return Ok(());
        }
        tracing::info!(count = open.len(), "Recovering open transfers from store");
        for record in open {
            if record.status == TransferStatus::Pending {
                self.activate_record(&record.key()).await?;
            }
            // Attesting/Relaying records are picked up by the first sweep.
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: NodeEvent) -> Result<(), StoreError> {
        match event {
            NodeEvent::Observed(event) => self.ingest_transfer(event, "watcher").await,
            NodeEvent::PeerTransfer(event) => self.ingest_transfer(event, "gossip").await,
            NodeEvent::PeerAttestation(attestation) => self.ingest_attestation(attestation).await,
            NodeEvent::PeerAnnounce(announce) => {
                tracing::debug!(
                    validator = %announce.validator_id,
                    version = %announce.node_version,
                    "Peer heartbeat"
                );
                Ok(())
            }
            NodeEvent::WatcherFault { chain, detail } => {
                let fault = RecordError::new(format!("watcher-{}", chain.namespace()), detail);
                *self.status.last_fault.write().expect("status lock") = Some(fault);
                Ok(())
            }
            NodeEvent::Fatal(_) => unreachable!("fatal handled by the run loop"),
        }
    }

    /// Insert-if-absent plus activation. Duplicate deliveries (watcher
    /// replay, gossip echo) hit the absent-check and stop there.
    async fn ingest_transfer(
        &mut self,
        event: TransferEvent,
        origin: &'static str,
    ) -> Result<(), StoreError> {
        if event.source.namespace() == event.destination.namespace() {
            tracing::warn!(transfer = %event.transfer_id, %origin, "Rejecting same-chain transfer");
            return Ok(());
        }
        let key = event.key();
        let inserted = self.store.put_transfer_if_absent(&event)?;
        if inserted {
            tracing::info!(%key, %origin, amount = %event.amount, "New transfer observed");
            if origin == "watcher" {
                self.publish(EnvelopeBody::Transfer(event)).await;
            }
            self.activate_record(&key).await?;
        } else {
            // Replayed event. If activation previously stalled on a
            // transient resolver error the record is still Pending; give
            // it another chance now instead of waiting for the sweep.
            if let Some(record) = self.store.get_transfer(&key)? {
                if record.status == TransferStatus::Pending {
                    self.activate_record(&key).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolve, sign, persist, publish: `Pending -> Attesting`, or
    /// `Pending -> Failed` when the asset is not registered.
    async fn activate_record(&mut self, key: &str) -> Result<(), StoreError> {
        let Some(record) = self.store.get_transfer(key)? else {
            return Ok(());
        };
        if record.status != TransferStatus::Pending {
            return Ok(());
        }
        let event = &record.event;

        let resolution = match self.backend.resolve(event).await {
            Ok(resolution) => resolution,
            Err(e @ ResolveError::NotRegistered { .. }) => {
                tracing::warn!(%key, error = %e, "Resolver miss; failing transfer");
                self.store.update_status(key, TransferStatus::Failed, |r| {
                    r.last_error = Some(RecordError::new("resolver-miss", e.to_string()));
                })?;
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(%key, error = %e, "Resolver unavailable; will retry");
                self.store.update_record(key, |r| {
                    r.last_error = Some(RecordError::new("resolver-transient", e.to_string()));
                })?;
                return Ok(());
            }
            Err(e) => {
                self.store.update_status(key, TransferStatus::Failed, |r| {
                    r.last_error = Some(RecordError::new("resolver", e.to_string()));
                })?;
                return Ok(());
            }
        };

        if self.signing.validator_id_for(event.destination).is_none() {
            self.store.update_status(key, TransferStatus::Failed, |r| {
                r.last_error = Some(RecordError::new(
                    "destination-disabled",
                    format!("no key material for {}", event.destination),
                ));
            })?;
            return Ok(());
        }

        let attestation = match self.signing.sign(event, &resolution) {
            Ok(attestation) => attestation,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Event failed signing validation");
                self.store.update_status(key, TransferStatus::Failed, |r| {
                    r.last_error = Some(RecordError::new("validation", e.to_string()));
                })?;
                return Ok(());
            }
        };
        let our_digest = attestation.message_digest.clone();
        self.store.append_attestation(&attestation)?;
        self.store.update_status(key, TransferStatus::Attesting, |_| {})?;
        self.publish(EnvelopeBody::Attestation(attestation)).await;

        // Peers may have attested before our watcher surfaced the event;
        // fold any rows that match the digest we just committed to.
        let pending = self.store.pending_attestations(key)?;
        let mut verified = Vec::new();
        for row in pending {
            if row.message_digest == our_digest && self.verify_peer(&row).await {
                verified.push(row);
            }
        }
        let attached = self.store.attach_attestations(key, &verified)?;
        if attached > 0 {
            tracing::info!(%key, attached, "Folded early peer attestations");
        }
        Ok(())
    }

    /// Dedup, verify, persist a peer attestation.
    async fn ingest_attestation(&mut self, attestation: Attestation) -> Result<(), StoreError> {
        let key = attestation.record_key();
        if let Some(record) = self.store.get_transfer(&key)? {
            if record.has_attestation_from(&attestation.validator_id) {
                tracing::debug!(%key, validator = %attestation.validator_id, "Duplicate attestation");
                return Ok(());
            }
            // Bind to the digest we signed, when we have one.
            let ours = self
                .signing
                .validator_id_for(attestation.destination)
                .and_then(|id| {
                    record
                        .attestations
                        .iter()
                        .find(|a| a.validator_id == id)
                        .map(|a| a.message_digest.clone())
                });
            if let Some(our_digest) = ours {
                if attestation.message_digest != our_digest {
                    tracing::warn!(
                        %key,
                        validator = %attestation.validator_id,
                        "Peer attested a different digest; discarding"
                    );
                    self.store
                        .bump_validator_counter(&attestation.validator_id, true)?;
                    return Ok(());
                }
            }
        }
        if !self.verify_peer(&attestation).await {
            self.store
                .bump_validator_counter(&attestation.validator_id, true)?;
            return Ok(());
        }
        let outcome = self.store.append_attestation(&attestation)?;
        self.store
            .bump_validator_counter(&attestation.validator_id, false)?;
        tracing::debug!(
            %key,
            validator = %attestation.validator_id,
            ?outcome,
            "Peer attestation stored"
        );
        Ok(())
    }

    /// Signature validity plus active-set membership.
    async fn verify_peer(&self, attestation: &Attestation) -> bool {
        if !self.signing.verify(attestation, &attestation.validator_id) {
            tracing::warn!(
                validator = %attestation.validator_id,
                transfer = %attestation.transfer_id,
                "Attestation signature failed verification"
            );
            return false;
        }
        match self
            .backend
            .is_validator(attestation.destination, &attestation.validator_id)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    validator = %attestation.validator_id,
                    "Attestation from outside the active set"
                );
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Validator-set lookup failed; discarding attestation");
                false
            }
        }
    }

    /// Every five seconds: re-activate stalled `Pending` records and push
    /// quorum-complete records into the relay engine.
    async fn sweep(&mut self) -> Result<(), StoreError> {
        let open = self.store.list_open_transfers()?;
        for record in open {
            let key = record.key();
            match record.status {
                TransferStatus::Pending => self.activate_record(&key).await?,
                TransferStatus::Attesting | TransferStatus::Relaying => {
                    self.try_relay(record).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn try_relay(&mut self, record: TransferRecord) -> Result<(), StoreError> {
        let key = record.key();
        let destination = record.event.destination;
        let Some(threshold) = self.current_threshold(destination).await else {
            tracing::warn!(%key, "Quorum threshold unavailable; skipping relay this sweep");
            return Ok(());
        };
        if (record.attestations.len() as u32) < threshold {
            tracing::debug!(
                %key,
                have = record.attestations.len(),
                need = threshold,
                "Below quorum"
            );
            return Ok(());
        }
        if record.status == TransferStatus::Attesting {
            self.store
                .update_status(&key, TransferStatus::Relaying, |_| {})?;
        }

        // The submission can take up to a confirmation timeout; run it off
        // the event loop. The relay engine's in-flight set keeps later
        // sweeps from double-submitting.
        let backend = self.backend.clone();
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let Ok(Some(record)) = store.get_transfer(&key) else {
                return;
            };
            let resolution = match backend.resolve(&record.event).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Re-resolution before relay failed");
                    return;
                }
            };
            let outcome = backend.relay(&record, &resolution, threshold).await;
            if let Err(e) = apply_relay_outcome(&store, &key, outcome) {
                tracing::error!(%key, error = %e, "Persistence failed applying relay outcome");
                cancel.cancel();
            }
        });
        Ok(())
    }

    /// Quorum threshold from the destination bridge, cached for a short
    /// TTL. Never a locally configured constant.
    async fn current_threshold(&mut self, destination: ChainId) -> Option<u32> {
        let namespace = destination.namespace();
        if let Some((threshold, fetched_at)) = self.thresholds.get(namespace) {
            if fetched_at.elapsed() < THRESHOLD_TTL {
                return Some(*threshold);
            }
        }
        match self.backend.validator_set(destination).await {
            Ok(set) => {
                let threshold = set.threshold;
                self.thresholds.insert(namespace, (threshold, Instant::now()));
                let mut sets = self.status.validator_sets.write().expect("status lock");
                sets.retain(|s| s.destination.namespace() != namespace);
                sets.push(set);
                Some(threshold)
            }
            Err(e) => {
                tracing::warn!(%destination, error = %e, "Validator set fetch failed");
                // A stale value is still safer than a local constant.
                self.thresholds.get(namespace).map(|(t, _)| *t)
            }
        }
    }

    async fn heartbeat(&self) {
        let Some(gossip) = &self.gossip else { return };
        let announce = Announce {
            validator_id: self.status.unit0_validator_id.clone(),
            node_version: env!("CARGO_PKG_VERSION").to_string(),
            waves_watermark: self.store.get_watermark("waves").ok().flatten(),
            unit0_watermark: self.store.get_watermark("unit0").ok().flatten(),
        };
        gossip
            .publish(Envelope::new(
                EnvelopeBody::Announce(announce),
                self.status.unit0_validator_id.clone(),
            ))
            .await;
    }

    async fn publish(&self, body: EnvelopeBody) {
        let Some(gossip) = &self.gossip else { return };
        gossip
            .publish(Envelope::new(
                body,
                self.status.unit0_validator_id.clone(),
            ))
            .await;
    }
}

/// Fold a relay outcome into the record. Runs on the relay task.
fn apply_relay_outcome(
    store: &Store,
    key: &str,
    outcome: RelayOutcome,
) -> Result<(), StoreError> {
    match outcome {
        RelayOutcome::Completed { tx_id } => {
            tracing::info!(%key, %tx_id, "Transfer relayed");
            store.update_status(key, TransferStatus::Completed, |r| {
                r.relay_tx_id = Some(tx_id);
                r.last_error = None;
            })?;
        }
        RelayOutcome::AlreadyProcessed => {
            tracing::info!(%key, "Destination already processed transfer");
            store.update_status(key, TransferStatus::Completed, |r| {
                r.last_error = None;
            })?;
        }
        RelayOutcome::InFlight => {}
        RelayOutcome::Transient { detail } => {
            tracing::warn!(%key, %detail, "Relay attempt hit a transient failure");
            store.update_record(key, |r| {
                r.last_error = Some(RecordError::new("relay-transient", detail));
            })?;
        }
        RelayOutcome::Rejected { detail } => {
            let record = store.update_record(key, |r| {
                r.relay_attempts += 1;
                r.last_error = Some(RecordError::new("relay-rejected", detail.clone()));
            })?;
            if record.relay_attempts >= MAX_RELAY_ATTEMPTS {
                tracing::error!(%key, %detail, attempts = record.relay_attempts, "Relay attempts exhausted");
                store.update_status(key, TransferStatus::Failed, |_| {})?;
            } else {
                tracing::warn!(%key, %detail, attempts = record.relay_attempts, "Relay rejected; will retry");
            }
        }
    }
    Ok(())
}

fn fatal(e: StoreError) -> String {
    e.to_string()
}
