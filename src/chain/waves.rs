//! Waves chain client.
//!
//! Talks to a Waves node over its REST API: block polling and invoke
//! extraction for the watcher, data-entry reads for the resolver and the
//! validator set, and release submission for the relay engine. Releases
//! are serialized to the invoke-script binary layout, signed with the
//! node's ed25519 key, and broadcast as JSON.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

use crate::signing::WavesKeypair;
use crate::types::{ChainId, TokenAmount, TokenKind, TransferEvent, UnixMillis};

/// Pseudo asset id of the chain's own coin; a lock payment without an
/// asset id refers to it.
pub const WAVES_ASSET: &str = "WAVES";

/// Fixed network fee for a release invoke, in wavelets.
pub const RELEASE_FEE: u64 = 900_000;

const INVOKE_TX_TYPE: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum WavesError {
    #[error("Waves HTTP failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Waves node rejected the request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Waves node rate-limited the request")]
    RateLimited,
    #[error("Unexpected payload from Waves node: {0}")]
    UnexpectedPayload(String),
    #[error("Invalid Waves address {0}")]
    BadAddress(String),
    #[error("Transaction {0} not confirmed in time")]
    Confirmation(String),
}

impl WavesError {
    pub fn is_transient(&self) -> bool {
        match self {
            WavesError::Http(_) | WavesError::RateLimited | WavesError::Confirmation(_) => true,
            WavesError::Api { status, .. } => *status == 429 || *status >= 500,
            WavesError::UnexpectedPayload(_) | WavesError::BadAddress(_) => false,
        }
    }
}

/// A typed data entry from the bridge dApp's account storage.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DataValue {
    Integer(i64),
    Boolean(bool),
    String(String),
    Binary(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataEntry {
    pub key: String,
    #[serde(flatten)]
    pub value: DataValue,
}

#[derive(Debug, Deserialize)]
struct HeightResponse {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    height: u64,
    #[serde(default)]
    transactions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    id: String,
}

/// Arguments of a Waves release invoke, assembled by the relay engine.
///
/// Signatures and public keys are positional pairs; the on-chain verifier
/// walks both lists in lockstep.
#[derive(Debug, Clone)]
pub struct WavesRelease {
    pub transfer_id: String,
    pub recipient: String,
    pub asset_id: String,
    pub amount: i64,
    pub signatures: Vec<Vec<u8>>,
    pub public_keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct WavesClient {
    http: reqwest::Client,
    base: Url,
    bridge_address: String,
    network_byte: u8,
    unit0_chain_id: u64,
}

impl WavesClient {
    pub fn new(
        mut base: Url,
        bridge_address: String,
        network_byte: u8,
        unit0_chain_id: u64,
    ) -> Result<Self, WavesError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        // Keep Url::join from swallowing the last path segment.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(WavesClient {
            http,
            base,
            bridge_address,
            network_byte,
            unit0_chain_id,
        })
    }

    pub fn chain(&self) -> ChainId {
        ChainId::Waves(self.network_byte)
    }

    fn endpoint(&self, path: &str) -> Result<Url, WavesError> {
        self.base
            .join(path)
            .map_err(|e| WavesError::UnexpectedPayload(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, WavesError> {
        Ok(self.get_json_opt(path).await?.ok_or_else(|| {
            WavesError::Api {
                status: 404,
                message: format!("{path} not found"),
            }
        })?)
    }

    /// GET returning `None` on 404, used for optional data rows.
    async fn get_json_opt<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, WavesError> {
        let response = self.http.get(self.endpoint(path)?).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(WavesError::RateLimited),
            status if status.is_success() => Ok(Some(response.json::<T>().await?)),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(WavesError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    pub async fn height(&self) -> Result<u64, WavesError> {
        let response: HeightResponse = self.get_json("blocks/height").await?;
        Ok(response.height)
    }

    /// Lock events for `[from, to]` inclusive, block by block, in
    /// `(block, intra-block)` order.
    pub async fn lock_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, WavesError> {
        let mut events = Vec::new();
        for height in from..=to {
            let block: BlockResponse = self.get_json(&format!("blocks/at/{height}")).await?;
            for tx in &block.transactions {
                match parse_lock_invoke(
                    tx,
                    &self.bridge_address,
                    self.network_byte,
                    self.unit0_chain_id,
                    block.height,
                ) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(reason) => {
                        tracing::warn!(height, %reason, "Skipping malformed bridge invoke");
                    }
                }
            }
        }
        Ok(events)
    }

    pub async fn data_entries(&self, matches: &str) -> Result<Vec<DataEntry>, WavesError> {
        self.get_json(&format!(
            "addresses/data/{}?matches={matches}",
            self.bridge_address
        ))
        .await
    }

    pub async fn data_entry(&self, key: &str) -> Result<Option<DataEntry>, WavesError> {
        self.get_json_opt(&format!("addresses/data/{}/{key}", self.bridge_address))
            .await
    }

    /// The bridge's replay-protection flag for a transfer.
    pub async fn processed(&self, transfer_id: &str) -> Result<bool, WavesError> {
        let entry = self.data_entry(&format!("processed_{transfer_id}")).await?;
        Ok(matches!(
            entry,
            Some(DataEntry {
                value: DataValue::Boolean(true),
                ..
            })
        ))
    }

    /// Validator set published in the bridge dApp's data rows:
    /// `validator_threshold` holds the quorum, `validator_<pubkey>` rows
    /// flag active members.
    pub async fn validator_set(&self) -> Result<crate::types::ValidatorSet, WavesError> {
        let entries = self.data_entries("validator_.*").await?;
        let mut threshold = 0u32;
        let mut members = Vec::new();
        for entry in entries {
            if entry.key == "validator_threshold" {
                if let DataValue::Integer(value) = entry.value {
                    threshold = u32::try_from(value.max(0)).unwrap_or(u32::MAX);
                }
            } else if let Some(member) = entry.key.strip_prefix("validator_") {
                if matches!(entry.value, DataValue::Boolean(true)) {
                    members.push(member.to_string());
                }
            }
        }
        Ok(crate::types::ValidatorSet {
            destination: self.chain(),
            threshold,
            active_count: members.len() as u32,
            members,
        })
    }

    /// Serialize, sign, and broadcast a release invoke. Returns the tx id.
    pub async fn submit_release(
        &self,
        release: &WavesRelease,
        keypair: &WavesKeypair,
    ) -> Result<String, WavesError> {
        let tx = InvokeScriptTx {
            chain_id: self.network_byte,
            sender_public_key: keypair.public_key_bytes(),
            d_app: self.bridge_address.clone(),
            function: "releaseTokens".to_string(),
            args: vec![
                InvokeArg::String(release.transfer_id.clone()),
                InvokeArg::String(release.recipient.clone()),
                InvokeArg::String(release.asset_id.clone()),
                InvokeArg::Integer(release.amount),
                InvokeArg::List(
                    release
                        .signatures
                        .iter()
                        .map(|s| InvokeArg::Binary(s.clone()))
                        .collect(),
                ),
                InvokeArg::List(
                    release
                        .public_keys
                        .iter()
                        .map(|k| InvokeArg::Binary(k.clone()))
                        .collect(),
                ),
            ],
            fee: RELEASE_FEE,
            timestamp: UnixMillis::now().0,
        };
        let body = tx.body_bytes()?;
        let proof = keypair.sign_raw(&body);
        let payload = tx.to_json(&bs58::encode(proof).into_string());

        let response = self
            .http
            .post(self.endpoint("transactions/broadcast")?)
            .json(&payload)
            .send()
            .await?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(WavesError::RateLimited),
            status if status.is_success() => {
                let broadcast: BroadcastResponse = response.json().await?;
                Ok(broadcast.id)
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(WavesError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// Poll until the transaction reaches a block, bounded by `timeout`.
    pub async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        timeout: Duration,
    ) -> Result<(), WavesError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let info: Option<Value> = self
                .get_json_opt(&format!("transactions/info/{tx_id}"))
                .await?;
            if let Some(info) = info {
                if info.get("height").and_then(Value::as_u64).is_some() {
                    let failed = info
                        .get("applicationStatus")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s != "succeeded");
                    if failed {
                        return Err(WavesError::Api {
                            status: 200,
                            message: format!("transaction {tx_id} failed on-chain"),
                        });
                    }
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WavesError::Confirmation(tx_id.to_string()));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

// ---- invoke extraction ----

#[derive(Debug, Deserialize)]
struct InvokeTx {
    id: String,
    sender: String,
    call: InvokeCall,
    #[serde(default)]
    payment: Vec<InvokePayment>,
    #[serde(rename = "applicationStatus")]
    application_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvokeCall {
    function: String,
    #[serde(default)]
    args: Vec<CallArg>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
enum CallArg {
    Integer(i64),
    String(String),
    Boolean(bool),
    Binary(String),
    List(Vec<CallArg>),
}

#[derive(Debug, Deserialize)]
struct InvokePayment {
    amount: u64,
    #[serde(rename = "assetId")]
    asset_id: Option<String>,
}

/// Extract a lock event from one raw block transaction, if it is a bridge
/// invoke. `Ok(None)` means "not ours"; `Err` means ours but malformed.
fn parse_lock_invoke(
    tx: &Value,
    bridge_address: &str,
    network_byte: u8,
    unit0_chain_id: u64,
    height: u64,
) -> Result<Option<TransferEvent>, String> {
    if tx.get("type").and_then(Value::as_u64) != Some(INVOKE_TX_TYPE) {
        return Ok(None);
    }
    if tx.get("dApp").and_then(Value::as_str) != Some(bridge_address) {
        return Ok(None);
    }
    let invoke: InvokeTx =
        serde_json::from_value(tx.clone()).map_err(|e| format!("invoke decode: {e}"))?;
    let kind = match invoke.call.function.as_str() {
        "lockTokens" => TokenKind::FungibleExternal,
        "lockNFT" => TokenKind::NonFungibleExternal,
        _ => return Ok(None),
    };
    if invoke
        .application_status
        .as_deref()
        .is_some_and(|s| s != "succeeded")
    {
        return Ok(None);
    }
    let [CallArg::String(recipient), CallArg::Integer(dest_chain)] = invoke.call.args.as_slice()
    else {
        return Err("expected (recipient: string, chain: integer) args".to_string());
    };
    if *dest_chain < 0 || *dest_chain as u64 != unit0_chain_id {
        return Err(format!("unexpected destination chain {dest_chain}"));
    }
    let [payment] = invoke.payment.as_slice() else {
        return Err(format!(
            "expected exactly one payment, got {}",
            invoke.payment.len()
        ));
    };
    let token = payment
        .asset_id
        .clone()
        .unwrap_or_else(|| WAVES_ASSET.to_string());
    Ok(Some(TransferEvent {
        transfer_id: invoke.id.clone(),
        source: ChainId::Waves(network_byte),
        destination: ChainId::Unit0(unit0_chain_id),
        token,
        amount: TokenAmount::from(payment.amount),
        sender: invoke.sender.clone(),
        recipient: recipient.clone(),
        kind,
        token_id: None,
        src_block: height,
        src_tx: invoke.id,
        observed_at: UnixMillis::now(),
    }))
}

// ---- invoke transaction codec ----

// RIDE expression tags used in the function-call argument encoding.
const ARG_LONG: u8 = 0;
const ARG_BYTES: u8 = 1;
const ARG_STRING: u8 = 2;
const ARG_TRUE: u8 = 6;
const ARG_FALSE: u8 = 7;
const ARG_LIST: u8 = 11;

/// One argument of an invoke-script function call.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeArg {
    Integer(i64),
    String(String),
    Binary(Vec<u8>),
    Boolean(bool),
    List(Vec<InvokeArg>),
}

impl InvokeArg {
    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            InvokeArg::Integer(value) => {
                out.push(ARG_LONG);
                out.extend_from_slice(&value.to_be_bytes());
            }
            InvokeArg::Binary(bytes) => {
                out.push(ARG_BYTES);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            InvokeArg::String(value) => {
                out.push(ARG_STRING);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value.as_bytes());
            }
            InvokeArg::Boolean(true) => out.push(ARG_TRUE),
            InvokeArg::Boolean(false) => out.push(ARG_FALSE),
            InvokeArg::List(items) => {
                out.push(ARG_LIST);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }

    fn to_json(&self) -> Value {
        match self {
            InvokeArg::Integer(value) => json!({"type": "integer", "value": value}),
            InvokeArg::String(value) => json!({"type": "string", "value": value}),
            InvokeArg::Boolean(value) => json!({"type": "boolean", "value": value}),
            InvokeArg::Binary(bytes) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                json!({"type": "binary", "value": format!("base64:{encoded}")})
            }
            InvokeArg::List(items) => {
                let values: Vec<Value> = items.iter().map(InvokeArg::to_json).collect();
                json!({"type": "list", "value": values})
            }
        }
    }
}

/// An unsigned invoke-script transaction, version 1.
#[derive(Debug, Clone)]
pub struct InvokeScriptTx {
    pub chain_id: u8,
    pub sender_public_key: [u8; 32],
    pub d_app: String,
    pub function: String,
    pub args: Vec<InvokeArg>,
    pub fee: u64,
    pub timestamp: u64,
}

impl InvokeScriptTx {
    /// The canonical body bytes the proof signs.
    pub fn body_bytes(&self) -> Result<Vec<u8>, WavesError> {
        let d_app_bytes = bs58::decode(&self.d_app)
            .into_vec()
            .map_err(|_| WavesError::BadAddress(self.d_app.clone()))?;
        if d_app_bytes.len() != 26 {
            return Err(WavesError::BadAddress(self.d_app.clone()));
        }
        let mut out = Vec::with_capacity(128);
        out.push(INVOKE_TX_TYPE as u8);
        out.push(1); // version
        out.push(self.chain_id);
        out.extend_from_slice(&self.sender_public_key);
        out.extend_from_slice(&d_app_bytes);
        // Function call: presence flag, serializer header, name, args.
        out.push(1);
        out.extend_from_slice(&[9, 1]);
        out.extend_from_slice(&(self.function.len() as u32).to_be_bytes());
        out.extend_from_slice(self.function.as_bytes());
        out.extend_from_slice(&(self.args.len() as u32).to_be_bytes());
        for arg in &self.args {
            arg.write_to(&mut out);
        }
        // Releases attach no payments.
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&self.fee.to_be_bytes());
        out.push(0); // fee in WAVES
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        Ok(out)
    }

    /// The JSON form the node's broadcast endpoint accepts.
    pub fn to_json(&self, proof_b58: &str) -> Value {
        let args: Vec<Value> = self.args.iter().map(InvokeArg::to_json).collect();
        json!({
            "type": INVOKE_TX_TYPE,
            "version": 1,
            "chainId": self.chain_id,
            "senderPublicKey": bs58::encode(self.sender_public_key).into_string(),
            "dApp": self.d_app,
            "call": {
                "function": self.function,
                "args": args,
            },
            "payment": [],
            "fee": self.fee,
            "feeAssetId": null,
            "timestamp": self.timestamp,
            "proofs": [proof_b58],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> &'static str {
        "3PBridgeDAppAddress111111111111111"
    }

    fn lock_tx_json(function: &str) -> Value {
        json!({
            "type": 16,
            "id": "5FooBarBazQuux",
            "sender": "3PSenderAddress",
            "dApp": bridge(),
            "applicationStatus": "succeeded",
            "call": {
                "function": function,
                "args": [
                    {"type": "string", "value": "0xabcdabcdabcdabcdabcdabcdabcdabcdabcd0001"},
                    {"type": "integer", "value": 88811}
                ]
            },
            "payment": [
                {"amount": 100000000u64, "assetId": null}
            ]
        })
    }

    #[test]
    fn test_parse_lock_tokens_invoke() {
        let event = parse_lock_invoke(&lock_tx_json("lockTokens"), bridge(), b'W', 88811, 1234)
            .unwrap()
            .unwrap();
        assert_eq!(event.transfer_id, "5FooBarBazQuux");
        assert_eq!(event.source, ChainId::Waves(b'W'));
        assert_eq!(event.destination, ChainId::Unit0(88811));
        assert_eq!(event.token, WAVES_ASSET);
        assert_eq!(event.amount, TokenAmount::from(100_000_000u64));
        assert_eq!(
            event.recipient,
            "0xabcdabcdabcdabcdabcdabcdabcdabcdabcd0001"
        );
        assert_eq!(event.kind, TokenKind::FungibleExternal);
        assert_eq!(event.src_block, 1234);
    }

    #[test]
    fn test_parse_lock_nft_invoke() {
        let mut tx = lock_tx_json("lockNFT");
        tx["payment"] = json!([{"amount": 1u64, "assetId": "9xNftAssetId"}]);
        let event = parse_lock_invoke(&tx, bridge(), b'W', 88811, 1)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, TokenKind::NonFungibleExternal);
        assert_eq!(event.token, "9xNftAssetId");
        assert_eq!(event.amount, TokenAmount::ONE);
    }

    #[test]
    fn test_foreign_transactions_are_not_ours() {
        // Different dApp.
        let mut tx = lock_tx_json("lockTokens");
        tx["dApp"] = json!("3POtherDApp");
        assert!(
            parse_lock_invoke(&tx, bridge(), b'W', 88811, 1)
                .unwrap()
                .is_none()
        );
        // Transfer transaction, not an invoke.
        let transfer = json!({"type": 4, "id": "x"});
        assert!(
            parse_lock_invoke(&transfer, bridge(), b'W', 88811, 1)
                .unwrap()
                .is_none()
        );
        // Invoke of an unrelated function.
        let other = lock_tx_json("swap");
        assert!(
            parse_lock_invoke(&other, bridge(), b'W', 88811, 1)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_malformed_bridge_invoke_is_an_error() {
        // Ours, but the payment entry is missing.
        let mut tx = lock_tx_json("lockTokens");
        tx["payment"] = json!([]);
        assert!(parse_lock_invoke(&tx, bridge(), b'W', 88811, 1).is_err());
        // Ours, but pointed at a chain we do not serve.
        let mut tx = lock_tx_json("lockTokens");
        tx["call"]["args"][1] = json!({"type": "integer", "value": 1});
        assert!(parse_lock_invoke(&tx, bridge(), b'W', 88811, 1).is_err());
    }

    #[test]
    fn test_failed_invoke_is_skipped() {
        let mut tx = lock_tx_json("lockTokens");
        tx["applicationStatus"] = json!("script_execution_failed");
        assert!(
            parse_lock_invoke(&tx, bridge(), b'W', 88811, 1)
                .unwrap()
                .is_none()
        );
    }

    fn sample_tx() -> InvokeScriptTx {
        // A base58 string decoding to exactly 26 bytes, like a real address.
        let d_app = bs58::encode([1u8; 26]).into_string();
        InvokeScriptTx {
            chain_id: b'W',
            sender_public_key: [7u8; 32],
            d_app,
            function: "releaseTokens".into(),
            args: vec![
                InvokeArg::String("transfer-1".into()),
                InvokeArg::Integer(42),
                InvokeArg::List(vec![InvokeArg::Binary(vec![0xAA; 64])]),
            ],
            fee: RELEASE_FEE,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_body_bytes_layout() {
        let tx = sample_tx();
        let body = tx.body_bytes().unwrap();
        // Header: type, version, chain id.
        assert_eq!(&body[..3], &[16, 1, b'W']);
        // Sender key then dApp address.
        assert_eq!(&body[3..35], &[7u8; 32]);
        assert_eq!(&body[35..61], &[1u8; 26]);
        // Call presence flag and serializer header.
        assert_eq!(&body[61..64], &[1, 9, 1]);
        // Function name, length-prefixed.
        assert_eq!(&body[64..68], &13u32.to_be_bytes());
        assert_eq!(&body[68..81], b"releaseTokens");
        // Three arguments follow.
        assert_eq!(&body[81..85], &3u32.to_be_bytes());
        // First argument: string tag + length + bytes.
        assert_eq!(body[85], ARG_STRING);
        // Trailer: zero payments, fee, WAVES fee asset, timestamp.
        let n = body.len();
        assert_eq!(&body[n - 19..n - 17], &0u16.to_be_bytes());
        assert_eq!(&body[n - 17..n - 9], &RELEASE_FEE.to_be_bytes());
        assert_eq!(body[n - 9], 0);
        assert_eq!(&body[n - 8..], &1_700_000_000_000u64.to_be_bytes());
    }

    #[test]
    fn test_body_bytes_is_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.body_bytes().unwrap(), tx.body_bytes().unwrap());
    }

    #[test]
    fn test_body_rejects_malformed_dapp_address() {
        let mut tx = sample_tx();
        tx.d_app = "not-base58-!!".into();
        assert!(tx.body_bytes().is_err());
        tx.d_app = bs58::encode([1u8; 10]).into_string();
        assert!(tx.body_bytes().is_err());
    }

    #[test]
    fn test_list_arg_encoding() {
        let arg = InvokeArg::List(vec![
            InvokeArg::Binary(vec![1, 2, 3]),
            InvokeArg::Boolean(true),
        ]);
        let mut out = Vec::new();
        arg.write_to(&mut out);
        assert_eq!(out[0], ARG_LIST);
        assert_eq!(&out[1..5], &2u32.to_be_bytes());
        assert_eq!(out[5], ARG_BYTES);
        assert_eq!(&out[6..10], &3u32.to_be_bytes());
        assert_eq!(&out[10..13], &[1, 2, 3]);
        assert_eq!(out[13], ARG_TRUE);
    }

    #[test]
    fn test_broadcast_json_shape() {
        let tx = sample_tx();
        let payload = tx.to_json("proofproof");
        assert_eq!(payload["type"], 16);
        assert_eq!(payload["version"], 1);
        assert_eq!(payload["feeAssetId"], Value::Null);
        assert_eq!(payload["proofs"][0], "proofproof");
        assert_eq!(payload["call"]["function"], "releaseTokens");
        // Binary list args render as base64-tagged strings.
        let list = &payload["call"]["args"][2];
        assert_eq!(list["type"], "list");
        let first = &list["value"][0];
        assert_eq!(first["type"], "binary");
        assert!(
            first["value"]
                .as_str()
                .unwrap()
                .starts_with("base64:")
        );
    }

    #[test]
    fn test_data_entry_decoding() {
        let entries: Vec<DataEntry> = serde_json::from_value(json!([
            {"key": "validator_threshold", "type": "integer", "value": 3},
            {"key": "validator_Gx5", "type": "boolean", "value": true},
            {"key": "token_map_9xAsset", "type": "string", "value": "0xdead|8|Name|SYM"}
        ]))
        .unwrap();
        assert_eq!(entries[0].value, DataValue::Integer(3));
        assert_eq!(entries[1].value, DataValue::Boolean(true));
        assert_eq!(
            entries[2].value,
            DataValue::String("0xdead|8|Name|SYM".into())
        );
    }
}
