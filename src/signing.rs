//! Chain-specific attestation signing and verification.
//!
//! Two disciplines live here, one per destination chain:
//!
//! - **Unit0**: keccak256 over the packed release arguments, wrapped in the
//!   Ethereum personal-message banner, signed with secp256k1 (RFC-6979).
//!   Verification recovers the 20-byte signer address from the prehash.
//! - **Waves**: sha256 over the plain concatenated release string, signed
//!   with deterministic ed25519. The attestation carries the public key;
//!   the Base58 public key doubles as the validator identity, matching the
//!   pairwise signature/key lists the on-chain verifier iterates.
//!
//! The engine holds key material only. It never touches the store or the
//! network, and both paths are deterministic: signing the same
//! `(event, resolution)` twice yields byte-identical attestations.

use alloy::primitives::{Address, B256, U256, eip191_hash_message, keccak256};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::resolver::Resolution;
use crate::types::{Attestation, ChainId, TransferEvent, UnixMillis};

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Transfer source and destination are the same chain")]
    SameChain,
    #[error("Zero amount is not attestable")]
    ZeroAmount,
    #[error("Non-fungible transfer must carry amount 1, got {0}")]
    NonFungibleAmount(String),
    #[error("Waves destination requires an ed25519 seed, none configured")]
    MissingWavesKey,
    #[error("Resolution does not match destination {0}")]
    ResolutionMismatch(ChainId),
    #[error("Invalid recipient address {address}: {reason}")]
    BadRecipient { address: String, reason: String },
    #[error("Invalid transfer id {id}: {reason}")]
    BadTransferId { id: String, reason: String },
    #[error("secp256k1 signing failed: {0}")]
    Secp256k1(#[from] alloy::signers::Error),
}

/// ed25519 key material for the Waves side.
pub struct WavesKeypair {
    signing_key: SigningKey,
    public_key_b58: String,
}

impl WavesKeypair {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key_b58 = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        WavesKeypair {
            signing_key,
            public_key_b58,
        }
    }

    /// Base58 public key, used verbatim as the Waves-side validator id.
    pub fn public_key_b58(&self) -> &str {
        &self.public_key_b58
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Deterministic ed25519 signature over arbitrary bytes. Also used for
    /// signing Waves transaction bodies during relay.
    pub fn sign_raw(&self, bytes: &[u8]) -> [u8; 64] {
        self.signing_key.sign(bytes).to_bytes()
    }
}

impl std::fmt::Debug for WavesKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WavesKeypair({})", self.public_key_b58)
    }
}

/// Produces and verifies attestations in both chains' native formats.
#[derive(Debug)]
pub struct SigningEngine {
    unit0_signer: PrivateKeySigner,
    unit0_address: Address,
    unit0_chain_id: u64,
    waves: Option<WavesKeypair>,
}

impl SigningEngine {
    pub fn new(
        unit0_signer: PrivateKeySigner,
        waves_seed: Option<&[u8; 32]>,
        unit0_chain_id: u64,
    ) -> Self {
        let unit0_address = unit0_signer.address();
        SigningEngine {
            unit0_signer,
            unit0_address,
            unit0_chain_id,
            waves: waves_seed.map(WavesKeypair::from_seed),
        }
    }

    /// Our identity on the Unit0 side: the secp256k1 address, 0x-hex.
    pub fn unit0_validator_id(&self) -> String {
        format!("{:#x}", self.unit0_address)
    }

    /// Our identity on the Waves side, if the seed is configured.
    pub fn waves_validator_id(&self) -> Option<String> {
        self.waves.as_ref().map(|k| k.public_key_b58().to_string())
    }

    /// Identity we sign with for a given destination, if enabled.
    pub fn validator_id_for(&self, destination: ChainId) -> Option<String> {
        match destination {
            ChainId::Unit0(_) => Some(self.unit0_validator_id()),
            ChainId::Waves(_) => self.waves_validator_id(),
        }
    }

    pub fn waves_keypair(&self) -> Option<&WavesKeypair> {
        self.waves.as_ref()
    }

    /// Sign a lock event for its destination chain.
    pub fn sign(
        &self,
        event: &TransferEvent,
        resolution: &Resolution,
    ) -> Result<Attestation, SigningError> {
        validate_event(event)?;
        match event.destination {
            ChainId::Unit0(_) => {
                let Resolution::Unit0Token(token_ref) = resolution else {
                    return Err(SigningError::ResolutionMismatch(event.destination));
                };
                self.sign_for_unit0(event, *token_ref)
            }
            ChainId::Waves(_) => {
                let Resolution::WavesAsset(asset_ref) = resolution else {
                    return Err(SigningError::ResolutionMismatch(event.destination));
                };
                self.sign_for_waves(event, asset_ref)
            }
        }
    }

    fn sign_for_unit0(
        &self,
        event: &TransferEvent,
        token_ref: Address,
    ) -> Result<Attestation, SigningError> {
        let digest = self.unit0_release_digest(event, token_ref)?;
        let signature = self.unit0_signer.sign_hash_sync(&digest)?;
        Ok(Attestation {
            transfer_id: event.transfer_id.clone(),
            source: event.source,
            destination: event.destination,
            validator_id: self.unit0_validator_id(),
            signature: signature.as_bytes().to_vec(),
            public_key: None,
            message_digest: digest.to_vec(),
            produced_at: UnixMillis::now(),
        })
    }

    fn sign_for_waves(
        &self,
        event: &TransferEvent,
        asset_ref: &str,
    ) -> Result<Attestation, SigningError> {
        let keypair = self.waves.as_ref().ok_or(SigningError::MissingWavesKey)?;
        let digest = self.waves_release_digest(event, asset_ref);
        let signature = keypair.sign_raw(&digest);
        Ok(Attestation {
            transfer_id: event.transfer_id.clone(),
            source: event.source,
            destination: event.destination,
            validator_id: keypair.public_key_b58().to_string(),
            signature: signature.to_vec(),
            public_key: Some(keypair.public_key_bytes().to_vec()),
            message_digest: digest.to_vec(),
            produced_at: UnixMillis::now(),
        })
    }

    /// The signed Unit0 digest: personal-message banner over the packed
    /// release arguments. This is byte-exact with the on-chain verifier.
    pub fn unit0_release_digest(
        &self,
        event: &TransferEvent,
        token_ref: Address,
    ) -> Result<B256, SigningError> {
        let outer = self.unit0_outer_digest(event, token_ref)?;
        Ok(eip191_hash_message(outer))
    }

    /// keccak256 of the packed (unprefixed, unpadded) release arguments.
    pub fn unit0_outer_digest(
        &self,
        event: &TransferEvent,
        token_ref: Address,
    ) -> Result<B256, SigningError> {
        let transfer_id = transfer_id_as_b32(event)?;
        let recipient =
            Address::from_str(&event.recipient).map_err(|e| SigningError::BadRecipient {
                address: event.recipient.clone(),
                reason: e.to_string(),
            })?;
        let token_id = event.token_id.map(|id| id.0).unwrap_or(U256::ZERO);
        let mut packed = Vec::with_capacity(32 + 20 + 32 + 20 + 1 + 32 + 32);
        packed.extend_from_slice(transfer_id.as_slice());
        packed.extend_from_slice(token_ref.as_slice());
        packed.extend_from_slice(&event.amount.0.to_be_bytes::<32>());
        packed.extend_from_slice(recipient.as_slice());
        packed.push(event.kind.as_u8());
        packed.extend_from_slice(&token_id.to_be_bytes::<32>());
        packed.extend_from_slice(&U256::from(self.unit0_chain_id).to_be_bytes::<32>());
        Ok(keccak256(&packed))
    }

    /// The signed Waves digest: sha256 over the separator-free release string.
    pub fn waves_release_digest(&self, event: &TransferEvent, asset_ref: &str) -> [u8; 32] {
        let message = format!(
            "{}{}{}{}{}",
            event.transfer_id, event.recipient, asset_ref, event.amount, self.unit0_chain_id
        );
        Sha256::digest(message.as_bytes()).into()
    }

    /// Check an attestation against the identity it claims.
    ///
    /// True only when the signature verifies under the destination chain's
    /// scheme *and* yields `expected_id`.
    pub fn verify(&self, attestation: &Attestation, expected_id: &str) -> bool {
        if attestation.validator_id != expected_id {
            return false;
        }
        match attestation.destination {
            ChainId::Unit0(_) => verify_unit0(attestation, expected_id),
            ChainId::Waves(_) => verify_waves(attestation, expected_id),
        }
    }
}

/// The 32-byte transfer id the Unit0 verifier keys its replay set by.
///
/// Unit0-originated ids are already a 0x-hex `bytes32`; Waves-originated
/// ids are Base58 text and hash through keccak256 of their UTF-8 form.
pub fn transfer_id_as_b32(event: &TransferEvent) -> Result<B256, SigningError> {
    match event.source {
        ChainId::Waves(_) => Ok(keccak256(event.transfer_id.as_bytes())),
        ChainId::Unit0(_) => {
            B256::from_str(&event.transfer_id).map_err(|e| SigningError::BadTransferId {
                id: event.transfer_id.clone(),
                reason: e.to_string(),
            })
        }
    }
}

fn validate_event(event: &TransferEvent) -> Result<(), SigningError> {
    if event.source.namespace() == event.destination.namespace() {
        return Err(SigningError::SameChain);
    }
    if event.amount.is_zero() {
        return Err(SigningError::ZeroAmount);
    }
    if event.kind.is_non_fungible() && event.amount != crate::types::TokenAmount::ONE {
        return Err(SigningError::NonFungibleAmount(event.amount.to_string()));
    }
    Ok(())
}

fn verify_unit0(attestation: &Attestation, expected_id: &str) -> bool {
    let Ok(expected) = Address::from_str(expected_id) else {
        return false;
    };
    let Ok(digest) = B256::try_from(attestation.message_digest.as_slice()) else {
        return false;
    };
    let Ok(signature) = alloy::primitives::Signature::from_raw(&attestation.signature) else {
        return false;
    };
    match signature.recover_address_from_prehash(&digest) {
        Ok(recovered) => recovered == expected,
        Err(_) => false,
    }
}

fn verify_waves(attestation: &Attestation, expected_id: &str) -> bool {
    let Some(public_key) = attestation.public_key.as_deref() else {
        return false;
    };
    if bs58::encode(public_key).into_string() != expected_id {
        return false;
    }
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(attestation.signature.as_slice()) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(&attestation.message_digest, &signature)
        .is_ok()
}
