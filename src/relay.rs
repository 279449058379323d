//! Release submission to the destination chain.
//!
//! Invoked by the coordinator once a record holds a quorum of verified
//! attestations. The engine re-reads the destination's replay-protection
//! flag before doing anything, assembles the signature material in the
//! exact shape each verifier expects, submits, and reports an outcome.
//! Status is never mutated here; the coordinator owns that.
//!
//! Idempotence: an in-flight set refuses a second submission for the same
//! record while one is outstanding, and the processed-flag re-check turns
//! a replayed trigger into a clean `AlreadyProcessed`.

use alloy::primitives::{Address, B256, Bytes, Signature, U256};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::unit0::{Unit0Client, Unit0Release};
use crate::chain::waves::{WavesClient, WavesRelease};
use crate::resolver::Resolution;
use crate::signing::{SigningEngine, transfer_id_as_b32};
use crate::types::{Attestation, ChainId, TransferRecord};

/// How long a Waves release waits for confirmation before the next sweep
/// takes over.
const WAVES_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one relay attempt, interpreted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Release confirmed on the destination chain.
    Completed { tx_id: String },
    /// The destination had already processed this transfer.
    AlreadyProcessed,
    /// A submission for this record is still outstanding; nothing done.
    InFlight,
    /// Worth retrying on a later sweep; the record stays `Relaying`.
    Transient { detail: String },
    /// The destination rejected the release; counts against the attempt
    /// budget and eventually fails the record.
    Rejected { detail: String },
}

pub struct RelayEngine {
    unit0: Arc<Unit0Client>,
    waves: Arc<WavesClient>,
    signing: Arc<SigningEngine>,
    inflight: DashMap<String, ()>,
}

impl RelayEngine {
    pub fn new(
        unit0: Arc<Unit0Client>,
        waves: Arc<WavesClient>,
        signing: Arc<SigningEngine>,
    ) -> Self {
        RelayEngine {
            unit0,
            waves,
            signing,
            inflight: DashMap::new(),
        }
    }

    /// Submit the release for `record` if nothing is outstanding for it.
    ///
    /// `threshold` is the destination bridge's current quorum, fetched by
    /// the coordinator immediately before the call.
    pub async fn relay(
        &self,
        record: &TransferRecord,
        resolution: &Resolution,
        threshold: u32,
    ) -> RelayOutcome {
        let key = record.key();
        if self.inflight.insert(key.clone(), ()).is_some() {
            return RelayOutcome::InFlight;
        }
        let _guard = InflightGuard {
            map: &self.inflight,
            key,
        };
        match record.event.destination {
            ChainId::Unit0(_) => self.relay_to_unit0(record, resolution, threshold).await,
            ChainId::Waves(_) => self.relay_to_waves(record, resolution, threshold).await,
        }
    }

    async fn relay_to_unit0(
        &self,
        record: &TransferRecord,
        resolution: &Resolution,
        threshold: u32,
    ) -> RelayOutcome {
        let Resolution::Unit0Token(token) = resolution else {
            return RelayOutcome::Rejected {
                detail: "resolution does not target unit0".into(),
            };
        };
        let transfer_id = match transfer_id_as_b32(&record.event) {
            Ok(id) => id,
            Err(e) => {
                return RelayOutcome::Rejected {
                    detail: e.to_string(),
                };
            }
        };
        match self.unit0.processed(transfer_id).await {
            Ok(true) => return RelayOutcome::AlreadyProcessed,
            Ok(false) => {}
            Err(e) => return classify_unit0(e),
        }
        let digest = match self.signing.unit0_release_digest(&record.event, *token) {
            Ok(digest) => digest,
            Err(e) => {
                return RelayOutcome::Rejected {
                    detail: e.to_string(),
                };
            }
        };
        let signatures = order_unit0_signatures(digest, &record.attestations);
        if signatures.len() < threshold as usize {
            // Two attestations recovering to one address count once; wait
            // for more signers rather than submit a doomed transaction.
            return RelayOutcome::Transient {
                detail: format!(
                    "{} distinct signers below threshold {threshold}",
                    signatures.len()
                ),
            };
        }
        let release = Unit0Release {
            transfer_id,
            token: *token,
            amount: record.event.amount.0,
            recipient: match record.event.recipient.parse::<Address>() {
                Ok(recipient) => recipient,
                Err(e) => {
                    return RelayOutcome::Rejected {
                        detail: format!("recipient: {e}"),
                    };
                }
            },
            kind: record.event.kind,
            token_id: record.event.token_id.map(|id| id.0).unwrap_or(U256::ZERO),
            signatures: signatures.into_iter().map(|(_, sig)| sig).collect(),
        };
        match self.unit0.submit_release(&release).await {
            Ok(tx_id) => RelayOutcome::Completed { tx_id },
            Err(e) => classify_unit0(e),
        }
    }

    async fn relay_to_waves(
        &self,
        record: &TransferRecord,
        resolution: &Resolution,
        threshold: u32,
    ) -> RelayOutcome {
        let Resolution::WavesAsset(asset_id) = resolution else {
            return RelayOutcome::Rejected {
                detail: "resolution does not target waves".into(),
            };
        };
        let Some(keypair) = self.signing.waves_keypair() else {
            return RelayOutcome::Rejected {
                detail: "waves destination disabled: no ed25519 seed configured".into(),
            };
        };
        match self.waves.processed(&record.event.transfer_id).await {
            Ok(true) => return RelayOutcome::AlreadyProcessed,
            Ok(false) => {}
            Err(e) => return classify_waves(e),
        }
        let digest = self
            .signing
            .waves_release_digest(&record.event, asset_id);
        let (signatures, public_keys) = pair_waves_signatures(&digest, &record.attestations);
        if signatures.len() < threshold as usize {
            return RelayOutcome::Transient {
                detail: format!(
                    "{} distinct signers below threshold {threshold}",
                    signatures.len()
                ),
            };
        }
        let amount = match i64::try_from(record.event.amount.0) {
            Ok(amount) => amount,
            Err(_) => {
                return RelayOutcome::Rejected {
                    detail: format!("amount {} exceeds waves integer range", record.event.amount),
                };
            }
        };
        let release = WavesRelease {
            transfer_id: record.event.transfer_id.clone(),
            recipient: record.event.recipient.clone(),
            asset_id: asset_id.clone(),
            amount,
            signatures,
            public_keys,
        };
        let tx_id = match self.waves.submit_release(&release, keypair).await {
            Ok(tx_id) => tx_id,
            Err(e) => return classify_waves(e),
        };
        match self
            .waves
            .wait_for_confirmation(&tx_id, WAVES_CONFIRMATION_TIMEOUT)
            .await
        {
            Ok(()) => RelayOutcome::Completed { tx_id },
            // The broadcast may still land; the next sweep re-checks the
            // processed flag before trying again.
            Err(e) => classify_waves(e),
        }
    }
}

struct InflightGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

fn classify_unit0(e: crate::chain::unit0::Unit0Error) -> RelayOutcome {
    if e.is_transient() {
        RelayOutcome::Transient {
            detail: e.to_string(),
        }
    } else {
        RelayOutcome::Rejected {
            detail: e.to_string(),
        }
    }
}

fn classify_waves(e: crate::chain::waves::WavesError) -> RelayOutcome {
    if e.is_transient() {
        RelayOutcome::Transient {
            detail: e.to_string(),
        }
    } else {
        RelayOutcome::Rejected {
            detail: e.to_string(),
        }
    }
}

/// Order Unit0 signatures the way the on-chain verifier demands: strictly
/// increasing 20-byte signer addresses, one contribution per signer.
///
/// Only attestations whose audited digest matches the digest we computed
/// are considered; anything unparseable or unrecoverable is skipped. The
/// recovered address is authoritative — two attestations recovering to the
/// same address collapse into one.
pub fn order_unit0_signatures(
    digest: B256,
    attestations: &[Attestation],
) -> Vec<(Address, Bytes)> {
    let mut by_signer: Vec<(Address, Bytes)> = Vec::new();
    for attestation in attestations {
        if !attestation.destination.is_unit0() {
            continue;
        }
        if attestation.message_digest.as_slice() != digest.as_slice() {
            tracing::warn!(
                validator = %attestation.validator_id,
                "Attestation digest mismatch; excluding from release"
            );
            continue;
        }
        let Ok(signature) = Signature::from_raw(&attestation.signature) else {
            continue;
        };
        let Ok(signer) = signature.recover_address_from_prehash(&digest) else {
            continue;
        };
        if by_signer.iter().any(|(address, _)| *address == signer) {
            continue;
        }
        by_signer.push((signer, Bytes::from(attestation.signature.clone())));
    }
    by_signer.sort_by_key(|(address, _)| *address);
    by_signer
}

/// Pair Waves signatures with their public keys, positionally.
///
/// The on-chain verifier iterates both lists in lockstep, so order is
/// identical and counts are equal by construction. Deduplicated by public
/// key; ordered by public key bytes for determinism.
pub fn pair_waves_signatures(
    digest: &[u8],
    attestations: &[Attestation],
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for attestation in attestations {
        if !attestation.destination.is_waves() {
            continue;
        }
        if attestation.message_digest.as_slice() != digest {
            continue;
        }
        let Some(public_key) = attestation.public_key.clone() else {
            continue;
        };
        if public_key.len() != 32 || attestation.signature.len() != 64 {
            continue;
        }
        if pairs.iter().any(|(pk, _)| *pk == public_key) {
            continue;
        }
        pairs.push((public_key, attestation.signature.clone()));
    }
    pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
    pairs.into_iter().map(|(pk, sig)| (sig, pk)).fold(
        (Vec::new(), Vec::new()),
        |(mut sigs, mut keys), (sig, pk)| {
            sigs.push(sig);
            keys.push(pk);
            (sigs, keys)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolution;
    use crate::types::{ChainId, TokenAmount, TokenKind, TransferEvent, UnixMillis};
    use alloy::primitives::address;
    use alloy::signers::local::PrivateKeySigner;
    use std::str::FromStr;

    fn signer(n: u8) -> PrivateKeySigner {
        let mut key = [0u8; 32];
        key[31] = n;
        PrivateKeySigner::from_bytes(&key.into()).unwrap()
    }

    fn engine_for(n: u8) -> SigningEngine {
        SigningEngine::new(signer(n), Some(&[n; 32]), 88811)
    }

    fn waves_lock_event() -> TransferEvent {
        TransferEvent {
            transfer_id: "5FooBarBazQuux".into(),
            source: ChainId::Waves(b'W'),
            destination: ChainId::Unit0(88811),
            token: "WAVES".into(),
            amount: TokenAmount::from(100_000_000u64),
            sender: "3PSender".into(),
            recipient: "0xabcdabcdabcdabcdabcdabcdabcdabcdabcd0001".into(),
            kind: TokenKind::FungibleExternal,
            token_id: None,
            src_block: 1,
            src_tx: "5FooBarBazQuux".into(),
            observed_at: UnixMillis(0),
        }
    }

    fn unit0_lock_event() -> TransferEvent {
        TransferEvent {
            transfer_id: format!("0x{}", hex::encode([9u8; 32])),
            source: ChainId::Unit0(88811),
            destination: ChainId::Waves(b'W'),
            token: "0x4025a8ee89daead315de690f0c250cab5309a115".into(),
            amount: TokenAmount::from(777u64),
            sender: "0xabcdabcdabcdabcdabcdabcdabcdabcdabcd0002".into(),
            recipient: "3PRecipient".into(),
            kind: TokenKind::FungibleWrapped,
            token_id: None,
            src_block: 2,
            src_tx: "0x00".into(),
            observed_at: UnixMillis(0),
        }
    }

    #[test]
    fn test_unit0_signatures_sorted_strictly_ascending() {
        let event = waves_lock_event();
        let token = address!("4025A8Ee89DAead315de690f0C250caB5309a115");
        let resolution = Resolution::Unit0Token(token);
        let engines = [engine_for(1), engine_for(2), engine_for(3)];
        let attestations: Vec<Attestation> = engines
            .iter()
            .map(|e| e.sign(&event, &resolution).unwrap())
            .collect();
        let digest = engines[0].unit0_release_digest(&event, token).unwrap();

        let ordered = order_unit0_signatures(digest, &attestations);
        assert_eq!(ordered.len(), 3);
        for pair in ordered.windows(2) {
            assert!(pair[0].0 < pair[1].0, "addresses must strictly increase");
        }
        // Stable under re-application and input order.
        let mut shuffled = attestations.clone();
        shuffled.reverse();
        assert_eq!(order_unit0_signatures(digest, &shuffled), ordered);
    }

    #[test]
    fn test_unit0_duplicate_signer_collapses() {
        let event = waves_lock_event();
        let token = address!("4025A8Ee89DAead315de690f0C250caB5309a115");
        let resolution = Resolution::Unit0Token(token);
        let engine = engine_for(1);
        let digest = engine.unit0_release_digest(&event, token).unwrap();
        let mut first = engine.sign(&event, &resolution).unwrap();
        let second = engine.sign(&event, &resolution).unwrap();
        // Same signer under two claimed identities still collapses, because
        // the recovered address is authoritative.
        first.validator_id = "0x0000000000000000000000000000000000000123".into();
        let ordered = order_unit0_signatures(digest, &[first, second]);
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_unit0_digest_mismatch_excluded() {
        let event = waves_lock_event();
        let token = address!("4025A8Ee89DAead315de690f0C250caB5309a115");
        let resolution = Resolution::Unit0Token(token);
        let engine = engine_for(1);
        let digest = engine.unit0_release_digest(&event, token).unwrap();
        let mut attestation = engine.sign(&event, &resolution).unwrap();
        attestation.message_digest = vec![0u8; 32];
        assert!(order_unit0_signatures(digest, &[attestation]).is_empty());
    }

    #[test]
    fn test_waves_pairs_positional_and_deduped() {
        let event = unit0_lock_event();
        let resolution = Resolution::WavesAsset("9xAsset".into());
        let engines = [engine_for(4), engine_for(5)];
        let mut attestations: Vec<Attestation> = engines
            .iter()
            .map(|e| e.sign(&event, &resolution).unwrap())
            .collect();
        // A duplicate from the first validator.
        attestations.push(attestations[0].clone());
        let digest = engines[0].waves_release_digest(&event, "9xAsset");

        let (signatures, public_keys) = pair_waves_signatures(&digest, &attestations);
        assert_eq!(signatures.len(), 2);
        assert_eq!(public_keys.len(), 2);
        assert!(public_keys[0] < public_keys[1]);
        // Each signature verifies under the key at the same position.
        for (signature, public_key) in signatures.iter().zip(&public_keys) {
            let key: [u8; 32] = public_key.as_slice().try_into().unwrap();
            let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key).unwrap();
            let sig: [u8; 64] = signature.as_slice().try_into().unwrap();
            use ed25519_dalek::Verifier;
            assert!(
                verifying
                    .verify(&digest, &ed25519_dalek::Signature::from_bytes(&sig))
                    .is_ok()
            );
        }
    }

    #[test]
    fn test_waves_pairs_require_key_material() {
        let event = unit0_lock_event();
        let engine = engine_for(6);
        let digest = engine.waves_release_digest(&event, "9xAsset");
        let mut attestation = engine
            .sign(&event, &Resolution::WavesAsset("9xAsset".into()))
            .unwrap();
        attestation.public_key = None;
        let (signatures, public_keys) = pair_waves_signatures(&digest, &[attestation]);
        assert!(signatures.is_empty());
        assert!(public_keys.is_empty());
    }

    #[test]
    fn test_cross_destination_attestations_filtered() {
        // A Waves-destination attestation never leaks into a Unit0 release.
        let unit0_event = waves_lock_event();
        let token = address!("4025A8Ee89DAead315de690f0C250caB5309a115");
        let engine = engine_for(7);
        let digest = engine.unit0_release_digest(&unit0_event, token).unwrap();
        let waves_attestation = engine
            .sign(
                &unit0_lock_event(),
                &Resolution::WavesAsset("9xAsset".into()),
            )
            .unwrap();
        assert!(order_unit0_signatures(digest, &[waves_attestation]).is_empty());
    }

    #[test]
    fn test_outcome_classification() {
        let reverted = crate::chain::unit0::Unit0Error::Reverted("0xdead".into());
        assert!(matches!(
            classify_unit0(reverted),
            RelayOutcome::Rejected { .. }
        ));
        let rate_limited = crate::chain::waves::WavesError::RateLimited;
        assert!(matches!(
            classify_waves(rate_limited),
            RelayOutcome::Transient { .. }
        ));
        let confirmation =
            crate::chain::waves::WavesError::Confirmation("tx".into());
        assert!(matches!(
            classify_waves(confirmation),
            RelayOutcome::Transient { .. }
        ));
    }

    #[test]
    fn test_signer_helper_addresses_differ() {
        // Guard against accidental key collisions in the fixtures above.
        let a1 = PrivateKeySigner::address(&signer(1));
        let a2 = PrivateKeySigner::address(&signer(2));
        assert_ne!(a1, a2);
        assert!(Address::from_str(&format!("{a1:#x}")).is_ok());
    }
}
