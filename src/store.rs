//! Append-oriented persistence on a single ordered key/value store.
//!
//! One sled tree holds everything, with prefixes chosen so related rows
//! iterate together:
//!
//! | key pattern                          | value                      |
//! |--------------------------------------|----------------------------|
//! | `transfer:<source>:<id>`             | JSON [`TransferRecord`]    |
//! | `attest:<source>:<id>:<validator>`   | JSON [`Attestation`]       |
//! | `watermark:waves` / `watermark:unit0`| decimal block height       |
//! | `validator:<id>`                     | JSON [`ValidatorCounters`] |
//!
//! Every handler writes here before acknowledging anything externally, so
//! a restart re-derives all pending work from the store alone. Store I/O
//! failure is fatal to the process.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::BTreeMap;
use std::path::Path;

use crate::types::{
    Attestation, TransferEvent, TransferRecord, TransferStatus, UnixMillis, ValidatorCounters,
};

const TRANSFER_PREFIX: &str = "transfer:";
const ATTEST_PREFIX: &str = "attest:";
const WATERMARK_PREFIX: &str = "watermark:";
const VALIDATOR_PREFIX: &str = "validator:";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O failure: {0}")]
    Io(#[from] sled::Error),
    #[error("Corrupt row under {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),
    #[error("Illegal status transition {from} -> {to} for {key}")]
    IllegalTransition {
        key: String,
        from: TransferStatus,
        to: TransferStatus,
    },
    #[error("Non-monotonic watermark for {chain}: have {current}, proposed {proposed}")]
    NonMonotonicWatermark {
        chain: String,
        current: u64,
        proposed: u64,
    },
}

impl StoreError {
    fn corrupt(key: &str, e: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Result of [`Store::append_attestation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Row written and attached to an existing record.
    Attached,
    /// Row written, but no record exists yet (gossip raced the watcher).
    RowOnly,
    /// `(transfer_id, validator_id)` was already present; nothing changed.
    Duplicate,
}

/// Counts per status, served by `/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub pending: u64,
    pub attesting: u64,
    pub relaying: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Handle over the node's sled database.
#[derive(Debug, Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open (or create) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let db = sled::open(data_dir.join("bridge-validator.db"))?;
        Ok(Store { db })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn temporary() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        Store { db }
    }

    fn transfer_key(record_key: &str) -> String {
        format!("{TRANSFER_PREFIX}{record_key}")
    }

    fn attest_key(record_key: &str, validator_id: &str) -> String {
        format!("{ATTEST_PREFIX}{record_key}:{validator_id}")
    }

    fn watermark_key(chain: &str) -> String {
        format!("{WATERMARK_PREFIX}{chain}")
    }

    /// Insert a fresh `Pending` record for `event` unless one exists.
    ///
    /// Returns whether the insert happened; an existing record is never
    /// overwritten, which is what makes watcher replays harmless.
    pub fn put_transfer_if_absent(&self, event: &TransferEvent) -> Result<bool, StoreError> {
        let key = Self::transfer_key(&event.key());
        let record = TransferRecord::new(event.clone());
        let bytes = serde_json::to_vec(&record).map_err(|e| StoreError::corrupt(&key, e))?;
        let swapped = self
            .db
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(bytes))?;
        Ok(swapped.is_ok())
    }

    pub fn get_transfer(&self, record_key: &str) -> Result<Option<TransferRecord>, StoreError> {
        let key = Self::transfer_key(record_key);
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                let record =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(&key, e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Write an attestation row and attach it to its record, atomically.
    ///
    /// Idempotent on `(transfer_id, validator_id)`: a duplicate leaves the
    /// store untouched. When the record does not exist yet the row alone is
    /// kept, to be folded in later by [`Store::attach_attestations`].
    pub fn append_attestation(&self, attestation: &Attestation) -> Result<AppendOutcome, StoreError> {
        let record_key = attestation.record_key();
        let attest_key = Self::attest_key(&record_key, &attestation.validator_id);
        let transfer_key = Self::transfer_key(&record_key);
        let attest_bytes =
            serde_json::to_vec(attestation).map_err(|e| StoreError::corrupt(&attest_key, e))?;

        let outcome = self.db.transaction(|tx| {
            if tx.get(attest_key.as_bytes())?.is_some() {
                return Ok(AppendOutcome::Duplicate);
            }
            tx.insert(attest_key.as_bytes(), attest_bytes.clone())?;
            let Some(bytes) = tx.get(transfer_key.as_bytes())? else {
                return Ok(AppendOutcome::RowOnly);
            };
            let mut record: TransferRecord = serde_json::from_slice(&bytes).map_err(|e| {
                ConflictableTransactionError::Abort(StoreError::corrupt(&transfer_key, e))
            })?;
            if !record.has_attestation_from(&attestation.validator_id) {
                record.attestations.push(attestation.clone());
                record.updated_at = UnixMillis::now();
            }
            let updated = serde_json::to_vec(&record).map_err(|e| {
                ConflictableTransactionError::Abort(StoreError::corrupt(&transfer_key, e))
            })?;
            tx.insert(transfer_key.as_bytes(), updated)?;
            Ok(AppendOutcome::Attached)
        });
        flatten_tx(outcome)
    }

    /// Attestation rows for `record_key` not yet attached to its record.
    pub fn pending_attestations(&self, record_key: &str) -> Result<Vec<Attestation>, StoreError> {
        let attached: Vec<String> = self
            .get_transfer(record_key)?
            .map(|r| {
                r.attestations
                    .iter()
                    .map(|a| a.validator_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        let prefix = format!("{ATTEST_PREFIX}{record_key}:");
        let mut rows = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let attestation: Attestation =
                serde_json::from_slice(&value).map_err(|e| StoreError::corrupt(&key_str, e))?;
            if !attached.contains(&attestation.validator_id) {
                rows.push(attestation);
            }
        }
        Ok(rows)
    }

    /// Fold previously stored rows into the record, deduplicating by
    /// validator id. Returns how many were attached.
    pub fn attach_attestations(
        &self,
        record_key: &str,
        attestations: &[Attestation],
    ) -> Result<usize, StoreError> {
        if attestations.is_empty() {
            return Ok(0);
        }
        let transfer_key = Self::transfer_key(record_key);
        let outcome = self.db.transaction(|tx| {
            let Some(bytes) = tx.get(transfer_key.as_bytes())? else {
                return Err(ConflictableTransactionError::Abort(
                    StoreError::UnknownTransfer(record_key.to_string()),
                ));
            };
            let mut record: TransferRecord = serde_json::from_slice(&bytes).map_err(|e| {
                ConflictableTransactionError::Abort(StoreError::corrupt(&transfer_key, e))
            })?;
            let mut attached = 0usize;
            for attestation in attestations {
                if !record.has_attestation_from(&attestation.validator_id) {
                    record.attestations.push(attestation.clone());
                    attached += 1;
                }
            }
            if attached > 0 {
                record.updated_at = UnixMillis::now();
                let updated = serde_json::to_vec(&record).map_err(|e| {
                    ConflictableTransactionError::Abort(StoreError::corrupt(&transfer_key, e))
                })?;
                tx.insert(transfer_key.as_bytes(), updated)?;
            }
            Ok(attached)
        });
        flatten_tx(outcome)
    }

    /// Advance a record along its lifecycle, enforcing the monotonic graph.
    ///
    /// `apply` runs on the loaded record after the transition check and may
    /// set `relay_tx_id`, bump `relay_attempts`, or record an error.
    pub fn update_status(
        &self,
        record_key: &str,
        next: TransferStatus,
        apply: impl FnOnce(&mut TransferRecord),
    ) -> Result<TransferRecord, StoreError> {
        let transfer_key = Self::transfer_key(record_key);
        let mut record = self
            .get_transfer(record_key)?
            .ok_or_else(|| StoreError::UnknownTransfer(record_key.to_string()))?;
        if record.status != next && !record.status.can_advance_to(next) {
            return Err(StoreError::IllegalTransition {
                key: record_key.to_string(),
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        apply(&mut record);
        record.updated_at = UnixMillis::now();
        let bytes =
            serde_json::to_vec(&record).map_err(|e| StoreError::corrupt(&transfer_key, e))?;
        self.db.insert(transfer_key.as_bytes(), bytes)?;
        Ok(record)
    }

    /// Record mutation without a status change (attempt counters, errors).
    pub fn update_record(
        &self,
        record_key: &str,
        apply: impl FnOnce(&mut TransferRecord),
    ) -> Result<TransferRecord, StoreError> {
        let status = self
            .get_transfer(record_key)?
            .ok_or_else(|| StoreError::UnknownTransfer(record_key.to_string()))?
            .status;
        self.update_status(record_key, status, apply)
    }

    pub fn get_watermark(&self, chain: &str) -> Result<Option<u64>, StoreError> {
        let key = Self::watermark_key(chain);
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes).to_string();
                let height = text
                    .parse::<u64>()
                    .map_err(|e| StoreError::corrupt(&key, e))?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    /// Monotonically advance a chain's watermark; non-increasing heights
    /// are rejected so a buggy watcher cannot rewind durable progress.
    pub fn advance_watermark(&self, chain: &str, height: u64) -> Result<(), StoreError> {
        if let Some(current) = self.get_watermark(chain)? {
            if height <= current {
                return Err(StoreError::NonMonotonicWatermark {
                    chain: chain.to_string(),
                    current,
                    proposed: height,
                });
            }
        }
        let key = Self::watermark_key(chain);
        self.db
            .insert(key.as_bytes(), height.to_string().as_bytes())?;
        Ok(())
    }

    /// Operator override: set the watermark regardless of the stored value.
    pub fn force_watermark(&self, chain: &str, height: u64) -> Result<(), StoreError> {
        let key = Self::watermark_key(chain);
        self.db
            .insert(key.as_bytes(), height.to_string().as_bytes())?;
        Ok(())
    }

    /// Records still needing coordinator work (`Pending | Attesting | Relaying`).
    pub fn list_open_transfers(&self) -> Result<Vec<TransferRecord>, StoreError> {
        self.list_transfers(|record| record.status.is_open())
    }

    pub fn list_transfers(
        &self,
        filter: impl Fn(&TransferRecord) -> bool,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.db.scan_prefix(TRANSFER_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let record: TransferRecord =
                serde_json::from_slice(&value).map_err(|e| StoreError::corrupt(&key_str, e))?;
            if filter(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for entry in self.db.scan_prefix(TRANSFER_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let record: TransferRecord =
                serde_json::from_slice(&value).map_err(|e| StoreError::corrupt(&key_str, e))?;
            match record.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::Attesting => stats.attesting += 1,
                TransferStatus::Relaying => stats.relaying += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    /// Bump the aggregate counters behind `validator:<id>`.
    pub fn bump_validator_counter(
        &self,
        validator_id: &str,
        rejected: bool,
    ) -> Result<(), StoreError> {
        let key = format!("{VALIDATOR_PREFIX}{validator_id}");
        let mut counters: ValidatorCounters = match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(&key, e))?
            }
            None => ValidatorCounters::default(),
        };
        counters.attestations_seen += 1;
        if rejected {
            counters.attestations_rejected += 1;
        }
        counters.last_seen = Some(UnixMillis::now());
        let bytes = serde_json::to_vec(&counters).map_err(|e| StoreError::corrupt(&key, e))?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn validator_counters(&self) -> Result<BTreeMap<String, ValidatorCounters>, StoreError> {
        let mut out = BTreeMap::new();
        for entry in self.db.scan_prefix(VALIDATOR_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let id = key_str
                .strip_prefix(VALIDATOR_PREFIX)
                .unwrap_or(&key_str)
                .to_string();
            let counters: ValidatorCounters =
                serde_json::from_slice(&value).map_err(|e| StoreError::corrupt(&key_str, e))?;
            out.insert(id, counters);
        }
        Ok(out)
    }

    /// Flush dirty pages to disk. Called on shutdown, after the tasks stop.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn flatten_tx<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(StoreError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, TokenAmount, TokenKind};

    fn sample_event(id: &str) -> TransferEvent {
        TransferEvent {
            transfer_id: id.to_string(),
            source: ChainId::Waves(b'W'),
            destination: ChainId::Unit0(88811),
            token: "WAVES".into(),
            amount: TokenAmount::from(100_000_000u64),
            sender: "3PSenderAddress".into(),
            recipient: "0x0000000000000000000000000000000000000001".into(),
            kind: TokenKind::FungibleExternal,
            token_id: None,
            src_block: 42,
            src_tx: id.to_string(),
            observed_at: UnixMillis(1_700_000_000_000),
        }
    }

    fn sample_attestation(id: &str, validator: &str) -> Attestation {
        Attestation {
            transfer_id: id.to_string(),
            source: ChainId::Waves(b'W'),
            destination: ChainId::Unit0(88811),
            validator_id: validator.to_string(),
            signature: vec![1u8; 65],
            public_key: None,
            message_digest: vec![2u8; 32],
            produced_at: UnixMillis(1_700_000_000_001),
        }
    }

    #[test]
    fn test_put_transfer_if_absent_inserts_once() {
        let store = Store::temporary();
        let event = sample_event("tx1");
        assert!(store.put_transfer_if_absent(&event).unwrap());
        assert!(!store.put_transfer_if_absent(&event).unwrap());
        let record = store.get_transfer("waves:tx1").unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.event, event);
    }

    #[test]
    fn test_append_attestation_is_idempotent() {
        let store = Store::temporary();
        store.put_transfer_if_absent(&sample_event("tx1")).unwrap();
        let attestation = sample_attestation("tx1", "0xv1");
        assert_eq!(
            store.append_attestation(&attestation).unwrap(),
            AppendOutcome::Attached
        );
        assert_eq!(
            store.append_attestation(&attestation).unwrap(),
            AppendOutcome::Duplicate
        );
        let record = store.get_transfer("waves:tx1").unwrap().unwrap();
        assert_eq!(record.attestations.len(), 1);
    }

    #[test]
    fn test_attestation_before_record_is_kept_as_row() {
        let store = Store::temporary();
        let attestation = sample_attestation("tx2", "0xv2");
        assert_eq!(
            store.append_attestation(&attestation).unwrap(),
            AppendOutcome::RowOnly
        );
        // Event shows up later; the pending row is still discoverable.
        store.put_transfer_if_absent(&sample_event("tx2")).unwrap();
        let pending = store.pending_attestations("waves:tx2").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            store.attach_attestations("waves:tx2", &pending).unwrap(),
            1
        );
        let record = store.get_transfer("waves:tx2").unwrap().unwrap();
        assert_eq!(record.attestations.len(), 1);
        // Attaching again changes nothing.
        assert_eq!(
            store.attach_attestations("waves:tx2", &pending).unwrap(),
            0
        );
    }

    #[test]
    fn test_attestation_count_matches_distinct_validators() {
        let store = Store::temporary();
        store.put_transfer_if_absent(&sample_event("tx3")).unwrap();
        for validator in ["0xa", "0xb", "0xa", "0xc"] {
            let _ = store
                .append_attestation(&sample_attestation("tx3", validator))
                .unwrap();
        }
        let record = store.get_transfer("waves:tx3").unwrap().unwrap();
        let mut ids: Vec<_> = record
            .attestations
            .iter()
            .map(|a| a.validator_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(record.attestations.len(), ids.len());
        assert_eq!(record.attestations.len(), 3);
    }

    #[test]
    fn test_watermark_rejects_non_increasing() {
        let store = Store::temporary();
        assert_eq!(store.get_watermark("waves").unwrap(), None);
        store.advance_watermark("waves", 100).unwrap();
        store.advance_watermark("waves", 101).unwrap();
        assert!(matches!(
            store.advance_watermark("waves", 101),
            Err(StoreError::NonMonotonicWatermark { .. })
        ));
        assert!(matches!(
            store.advance_watermark("waves", 50),
            Err(StoreError::NonMonotonicWatermark { .. })
        ));
        assert_eq!(store.get_watermark("waves").unwrap(), Some(101));
        // The operator override may rewind.
        store.force_watermark("waves", 50).unwrap();
        assert_eq!(store.get_watermark("waves").unwrap(), Some(50));
    }

    #[test]
    fn test_status_transitions_enforced() {
        let store = Store::temporary();
        store.put_transfer_if_absent(&sample_event("tx4")).unwrap();
        store
            .update_status("waves:tx4", TransferStatus::Attesting, |_| {})
            .unwrap();
        store
            .update_status("waves:tx4", TransferStatus::Relaying, |_| {})
            .unwrap();
        let err = store
            .update_status("waves:tx4", TransferStatus::Pending, |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        let record = store
            .update_status("waves:tx4", TransferStatus::Completed, |r| {
                r.relay_tx_id = Some("0xrelay".into());
            })
            .unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.relay_tx_id.as_deref(), Some("0xrelay"));
    }

    #[test]
    fn test_list_open_transfers_filters_terminal() {
        let store = Store::temporary();
        for id in ["a", "b", "c"] {
            store.put_transfer_if_absent(&sample_event(id)).unwrap();
        }
        store
            .update_status("waves:b", TransferStatus::Failed, |_| {})
            .unwrap();
        let open = store.list_open_transfers().unwrap();
        let ids: Vec<_> = open.iter().map(|r| r.event.transfer_id.clone()).collect();
        assert_eq!(open.len(), 2);
        assert!(!ids.contains(&"b".to_string()));
    }

    #[test]
    fn test_stats_counts_by_status() {
        let store = Store::temporary();
        for id in ["a", "b", "c", "d"] {
            store.put_transfer_if_absent(&sample_event(id)).unwrap();
        }
        store
            .update_status("waves:a", TransferStatus::Attesting, |_| {})
            .unwrap();
        store
            .update_status("waves:b", TransferStatus::Failed, |_| {})
            .unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.attesting, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 4);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let event = sample_event("restart");
        {
            let store = Store::open(dir.path()).unwrap();
            store.put_transfer_if_absent(&event).unwrap();
            store.advance_watermark("unit0", 7777).unwrap();
            store.flush().unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_watermark("unit0").unwrap(), Some(7777));
        let record = store.get_transfer("waves:restart").unwrap().unwrap();
        assert_eq!(record.event, event);
        // Watermark monotonicity spans restarts.
        assert!(store.advance_watermark("unit0", 7777).is_err());
    }

    #[test]
    fn test_validator_counters_accumulate() {
        let store = Store::temporary();
        store.bump_validator_counter("0xv1", false).unwrap();
        store.bump_validator_counter("0xv1", true).unwrap();
        store.bump_validator_counter("0xv2", false).unwrap();
        let counters = store.validator_counters().unwrap();
        assert_eq!(counters["0xv1"].attestations_seen, 2);
        assert_eq!(counters["0xv1"].attestations_rejected, 1);
        assert_eq!(counters["0xv2"].attestations_seen, 1);
    }
}
