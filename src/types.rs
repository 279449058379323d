//! Core data model of the bridge validator.
//!
//! Everything that crosses a component boundary lives here: chain
//! identifiers, observed lock events, validator attestations, and the
//! mutable transfer record the coordinator drives through its lifecycle.
//!
//! Integers that must survive JSON without precision loss ([`TokenAmount`],
//! [`TokenId`], [`UnixMillis`]) serialize as stringified decimals.

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

/// Identifies one side of the bridge.
///
/// Serialized in `namespace:reference` form: `waves:W` carries the one-byte
/// Waves network tag, `unit0:88811` carries the numeric EVM chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainId {
    /// The Waves network, tagged with its network byte (`W` mainnet, `T` testnet).
    Waves(u8),
    /// The Unit Zero network, tagged with its numeric chain id.
    Unit0(u64),
}

impl ChainId {
    /// Namespace prefix used in store keys and wire form.
    pub fn namespace(&self) -> &'static str {
        match self {
            ChainId::Waves(_) => "waves",
            ChainId::Unit0(_) => "unit0",
        }
    }

    pub fn is_waves(&self) -> bool {
        matches!(self, ChainId::Waves(_))
    }

    pub fn is_unit0(&self) -> bool {
        matches!(self, ChainId::Unit0(_))
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainId::Waves(tag) => write!(f, "waves:{}", *tag as char),
            ChainId::Unit0(id) => write!(f, "unit0:{id}"),
        }
    }
}

/// Error produced when parsing a [`ChainId`] from its wire form.
#[derive(Debug, thiserror::Error)]
#[error("Invalid chain id: {0}")]
pub struct ChainIdParseError(String);

impl FromStr for ChainId {
    type Err = ChainIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s
            .split_once(':')
            .ok_or_else(|| ChainIdParseError(s.to_string()))?;
        match namespace {
            "waves" => {
                let mut chars = reference.chars();
                match (chars.next(), chars.next()) {
                    (Some(tag), None) if tag.is_ascii() => Ok(ChainId::Waves(tag as u8)),
                    _ => Err(ChainIdParseError(s.to_string())),
                }
            }
            "unit0" => reference
                .parse::<u64>()
                .map(ChainId::Unit0)
                .map_err(|_| ChainIdParseError(s.to_string())),
            _ => Err(ChainIdParseError(s.to_string())),
        }
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of asset moved by a transfer.
///
/// The discriminant is the byte that enters the packed release digest and
/// mirrors the `tokenType` enum emitted by the Unit0 bridge contract.
/// "Wrapped" means the token's canonical home is the *other* chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum TokenKind {
    FungibleExternal = 0,
    FungibleWrapped = 1,
    NonFungibleExternal = 2,
    NonFungibleWrapped = 3,
    Native = 4,
}

impl TokenKind {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Map the on-chain `tokenType` byte to a kind.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TokenKind::FungibleExternal),
            1 => Some(TokenKind::FungibleWrapped),
            2 => Some(TokenKind::NonFungibleExternal),
            3 => Some(TokenKind::NonFungibleWrapped),
            4 => Some(TokenKind::Native),
            _ => None,
        }
    }

    pub fn is_non_fungible(&self) -> bool {
        matches!(
            self,
            TokenKind::NonFungibleExternal | TokenKind::NonFungibleWrapped
        )
    }
}

/// A token amount in the source chain's smallest unit.
///
/// Serialized as a stringified decimal to avoid loss of precision in JSON;
/// `100000000` becomes `"100000000"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256::ZERO);
    pub const ONE: TokenAmount = TokenAmount(U256::ONE);

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        TokenAmount(value)
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let value = U256::from_str_radix(&s, 10)
            .map_err(|_| serde::de::Error::custom("amount must be a decimal integer"))?;
        Ok(TokenAmount(value))
    }
}

/// Identifier of a non-fungible token, serialized like [`TokenAmount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenId(pub U256);

impl From<u64> for TokenId {
    fn from(value: u64) -> Self {
        TokenId(U256::from(value))
    }
}

impl From<U256> for TokenId {
    fn from(value: U256) -> Self {
        TokenId(value)
    }
}

impl Display for TokenId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let value = U256::from_str_radix(&s, 10)
            .map_err(|_| serde::de::Error::custom("token id must be a decimal integer"))?;
        Ok(TokenId(value))
    }
}

/// Milliseconds since the Unix epoch, serialized as a stringified integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        UnixMillis(ms)
    }

    pub fn saturating_age_ms(&self, now: UnixMillis) -> u64 {
        now.0.saturating_sub(self.0)
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for UnixMillis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixMillis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let ms = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixMillis(ms))
    }
}

/// A lock event observed on a source chain, immutable once built.
///
/// `(source, transfer_id)` is the global primary key. The `token` string is
/// source-relative: a Base58 asset id (or `WAVES`) on the Waves side, a
/// 0x-hex address on the Unit0 side. `recipient` is already in the
/// *destination* chain's address format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub transfer_id: String,
    pub source: ChainId,
    pub destination: ChainId,
    pub token: String,
    pub amount: TokenAmount,
    pub sender: String,
    pub recipient: String,
    pub kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
    pub src_block: u64,
    pub src_tx: String,
    pub observed_at: UnixMillis,
}

impl TransferEvent {
    /// Store key of the record this event belongs to.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source.namespace(), self.transfer_id)
    }
}

/// A validator's signed statement that a lock event should be released.
///
/// `validator_id` is the signer's identity in the destination chain's
/// address space: a 0x-hex address for Unit0, a Base58 ed25519 public key
/// for Waves. Signature bytes travel Base58 on the wire regardless of
/// scheme; `message_digest` keeps the exact signed bytes for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub transfer_id: String,
    pub source: ChainId,
    pub destination: ChainId,
    pub validator_id: String,
    #[serde(with = "serde_b58")]
    pub signature: Vec<u8>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_b58_opt"
    )]
    pub public_key: Option<Vec<u8>>,
    #[serde(with = "serde_b58")]
    pub message_digest: Vec<u8>,
    pub produced_at: UnixMillis,
}

impl Attestation {
    pub fn record_key(&self) -> String {
        format!("{}:{}", self.source.namespace(), self.transfer_id)
    }
}

/// Base58 wire encoding for byte vectors.
pub mod serde_b58 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bs58::encode(bytes).into_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        bs58::decode(&s)
            .into_vec()
            .map_err(|e| serde::de::Error::custom(format!("invalid base58: {e}")))
    }
}

mod serde_b58_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&bs58::encode(bytes).into_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => bs58::decode(&s)
                .into_vec()
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid base58: {e}"))),
        }
    }
}

/// Lifecycle state of a transfer record.
///
/// Progression is monotonic; `Failed` is terminal and only leaves that
/// state when an operator resets the record to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    Attesting,
    Relaying,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Whether a transition from `self` to `next` respects the lifecycle graph.
    pub fn can_advance_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Attesting) | (Pending, Failed) => true,
            (Attesting, Relaying) | (Attesting, Failed) => true,
            (Relaying, Completed) | (Relaying, Failed) => true,
            // Operator-initiated retry of a dead record.
            (Failed, Pending) => true,
            _ => false,
        }
    }

    /// Records in these states still need coordinator work.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TransferStatus::Pending | TransferStatus::Attesting | TransferStatus::Relaying
        )
    }
}

impl Display for TransferStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Attesting => "attesting",
            TransferStatus::Relaying => "relaying",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The mutable record a transfer accumulates while crossing the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub event: TransferEvent,
    pub attestations: Vec<Attestation>,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_tx_id: Option<String>,
    #[serde(default)]
    pub relay_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RecordError>,
    pub created_at: UnixMillis,
    pub updated_at: UnixMillis,
}

impl TransferRecord {
    pub fn new(event: TransferEvent) -> Self {
        let now = UnixMillis::now();
        TransferRecord {
            event,
            attestations: Vec::new(),
            status: TransferStatus::Pending,
            relay_tx_id: None,
            relay_attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        self.event.key()
    }

    /// Whether an attestation from `validator_id` is already attached.
    pub fn has_attestation_from(&self, validator_id: &str) -> bool {
        self.attestations
            .iter()
            .any(|a| a.validator_id == validator_id)
    }
}

/// Last error surfaced for a record, kept for the status HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: String,
    pub detail: String,
    pub at: UnixMillis,
}

impl RecordError {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        RecordError {
            kind: kind.into(),
            detail: detail.into(),
            at: UnixMillis::now(),
        }
    }
}

/// Validator set of a destination chain, fetched from its bridge contract.
///
/// `members` is only enumerable on the Waves side; the Unit0 contract
/// exposes membership as a per-address predicate instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub destination: ChainId,
    pub threshold: u32,
    pub active_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// Aggregate attestation counters kept per validator identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorCounters {
    pub attestations_seen: u64,
    pub attestations_rejected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<UnixMillis>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_roundtrip_waves() {
        let id = ChainId::Waves(b'W');
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"waves:W\"");
        let back: ChainId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_chain_id_roundtrip_unit0() {
        let id = ChainId::Unit0(88811);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"unit0:88811\"");
        let back: ChainId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_chain_id_rejects_garbage() {
        assert!("waves".parse::<ChainId>().is_err());
        assert!("waves:WX".parse::<ChainId>().is_err());
        assert!("unit0:not-a-number".parse::<ChainId>().is_err());
        assert!("cosmos:1".parse::<ChainId>().is_err());
    }

    #[test]
    fn test_token_kind_bytes() {
        assert_eq!(TokenKind::FungibleExternal.as_u8(), 0);
        assert_eq!(TokenKind::FungibleWrapped.as_u8(), 1);
        assert_eq!(TokenKind::NonFungibleExternal.as_u8(), 2);
        assert_eq!(TokenKind::NonFungibleWrapped.as_u8(), 3);
        assert_eq!(TokenKind::Native.as_u8(), 4);
        for byte in 0..=4u8 {
            assert_eq!(TokenKind::from_u8(byte).unwrap().as_u8(), byte);
        }
        assert!(TokenKind::from_u8(5).is_none());
    }

    #[test]
    fn test_amount_serializes_as_decimal_string() {
        let amount = TokenAmount(U256::from(100_000_000u64));
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"100000000\"");
        let back: TokenAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_amount_survives_u256_range() {
        let amount = TokenAmount(U256::MAX);
        let json = serde_json::to_string(&amount).unwrap();
        let back: TokenAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_amount_rejects_float_notation() {
        assert!(serde_json::from_str::<TokenAmount>("\"1.5\"").is_err());
        assert!(serde_json::from_str::<TokenAmount>("\"1e8\"").is_err());
    }

    #[test]
    fn test_status_monotonic_graph() {
        use TransferStatus::*;
        assert!(Pending.can_advance_to(Attesting));
        assert!(Attesting.can_advance_to(Relaying));
        assert!(Relaying.can_advance_to(Completed));
        assert!(Pending.can_advance_to(Failed));
        assert!(Attesting.can_advance_to(Failed));
        assert!(Relaying.can_advance_to(Failed));
        // No rollbacks.
        assert!(!Attesting.can_advance_to(Pending));
        assert!(!Relaying.can_advance_to(Attesting));
        assert!(!Completed.can_advance_to(Relaying));
        assert!(!Completed.can_advance_to(Failed));
        // Operator retry is the only way out of Failed.
        assert!(Failed.can_advance_to(Pending));
        assert!(!Failed.can_advance_to(Relaying));
    }

    #[test]
    fn test_attestation_wire_form_is_base58() {
        let attestation = Attestation {
            transfer_id: "abc".into(),
            source: ChainId::Unit0(88811),
            destination: ChainId::Waves(b'W'),
            validator_id: "validator".into(),
            signature: vec![1, 2, 3, 4],
            public_key: Some(vec![9, 9, 9]),
            message_digest: vec![7; 32],
            produced_at: UnixMillis(1_700_000_000_000),
        };
        let json = serde_json::to_value(&attestation).unwrap();
        let signature = json.get("signature").unwrap().as_str().unwrap();
        assert_eq!(bs58::decode(signature).into_vec().unwrap(), vec![1, 2, 3, 4]);
        let back: Attestation = serde_json::from_value(json).unwrap();
        assert_eq!(back, attestation);
    }

    #[test]
    fn test_record_key_is_source_qualified() {
        let event = TransferEvent {
            transfer_id: "5FooBarBaz".into(),
            source: ChainId::Waves(b'W'),
            destination: ChainId::Unit0(88811),
            token: "WAVES".into(),
            amount: TokenAmount::from(100u64),
            sender: "3PSender".into(),
            recipient: "0x0000000000000000000000000000000000000001".into(),
            kind: TokenKind::FungibleExternal,
            token_id: None,
            src_block: 10,
            src_tx: "5FooBarBaz".into(),
            observed_at: UnixMillis(0),
        };
        assert_eq!(event.key(), "waves:5FooBarBaz");
    }
}
