//! Unit0 (EVM) chain client.
//!
//! Wraps an Alloy provider with the node's wallet attached and exposes the
//! bridge contract surface: lock-event log queries for the watcher, the
//! read surface for the resolver and quorum arithmetic, and the release
//! calls for the relay engine. Gas for releases is estimated and padded
//! with 20% head-room.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use std::str::FromStr;
use url::Url;

use crate::types::{ChainId, TokenAmount, TokenId, TokenKind, TransferEvent, UnixMillis};

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[sol(rpc)]
    interface IUnit0Bridge {
        event TokensLocked(
            bytes32 indexed lockId,
            address indexed token,
            uint256 amount,
            address indexed sender,
            string wavesDestination,
            uint256 nonce,
            uint8 tokenType,
            uint256 tokenId
        );

        function wavesToUnit0Token(string assetId) external view returns (address);
        function processedTransfers(bytes32 transferId) external view returns (bool);
        function validatorThreshold() external view returns (uint256);
        function activeValidatorCount() external view returns (uint256);
        function isValidator(address validator) external view returns (bool);

        function releaseTokens(
            bytes32 transferId,
            address token,
            uint256 amount,
            address recipient,
            uint8 tokenKind,
            uint256 tokenId,
            bytes[] signatures
        ) external;

        function releaseNFT(
            bytes32 transferId,
            address token,
            address recipient,
            uint256 tokenId,
            bytes[] signatures
        ) external;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Unit0Error {
    #[error("Unit0 RPC failure: {0}")]
    Rpc(#[from] alloy::transports::TransportError),
    #[error("Unit0 contract call failed: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("Unit0 transaction did not confirm: {0}")]
    Confirmation(#[from] alloy::providers::PendingTransactionError),
    #[error("Unit0 transaction {0} reverted")]
    Reverted(String),
    #[error("Log is missing its block number")]
    MissingBlockNumber,
    #[error("Unexpected value in log: {0}")]
    MalformedLog(String),
}

impl Unit0Error {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            Unit0Error::Rpc(_) | Unit0Error::Confirmation(_) => true,
            Unit0Error::Contract(e) => {
                let text = e.to_string().to_lowercase();
                text.contains("429")
                    || text.contains("too many requests")
                    || text.contains("rate limit")
                    || text.contains("timed out")
                    || text.contains("connection")
            }
            Unit0Error::Reverted(_)
            | Unit0Error::MissingBlockNumber
            | Unit0Error::MalformedLog(_) => false,
        }
    }
}

/// Arguments of a Unit0 release submission, assembled by the relay engine.
#[derive(Debug, Clone)]
pub struct Unit0Release {
    pub transfer_id: B256,
    pub token: Address,
    pub amount: U256,
    pub recipient: Address,
    pub kind: TokenKind,
    pub token_id: U256,
    /// 65-byte signatures sorted by recovered signer address, ascending.
    pub signatures: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub struct Unit0Client {
    provider: DynProvider,
    bridge: Address,
    chain_id: u64,
    waves_network: u8,
}

impl Unit0Client {
    pub fn connect(
        rpc_url: &Url,
        signer: PrivateKeySigner,
        chain_id: u64,
        bridge: Address,
        waves_network: u8,
    ) -> Self {
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(rpc_url.clone())
            .erased();
        Unit0Client {
            provider,
            bridge,
            chain_id,
            waves_network,
        }
    }

    pub fn chain(&self) -> ChainId {
        ChainId::Unit0(self.chain_id)
    }

    pub async fn block_number(&self) -> Result<u64, Unit0Error> {
        Ok(self.provider.get_block_number().await?)
    }

    /// Lock events for `[from, to]` inclusive, in `(block, log index)` order.
    pub async fn lock_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, Unit0Error> {
        let filter = Filter::new()
            .address(self.bridge)
            .event_signature(IUnit0Bridge::TokensLocked::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);
        let logs = self.provider.get_logs(&filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            events.push(self.event_from_log(log)?);
        }
        events.sort_by_key(|e| (e.src_block, e.src_tx.clone(), e.transfer_id.clone()));
        Ok(events)
    }

    fn event_from_log(&self, log: Log) -> Result<TransferEvent, Unit0Error> {
        let block = log.block_number.ok_or(Unit0Error::MissingBlockNumber)?;
        let tx_hash = log
            .transaction_hash
            .map(|h| format!("0x{}", hex::encode(h)))
            .unwrap_or_default();
        let decoded = log
            .log_decode::<IUnit0Bridge::TokensLocked>()
            .map_err(|e| Unit0Error::MalformedLog(e.to_string()))?;
        let data = decoded.inner.data;
        let kind = TokenKind::from_u8(data.tokenType)
            .ok_or_else(|| Unit0Error::MalformedLog(format!("tokenType {}", data.tokenType)))?;
        let token_id = kind.is_non_fungible().then(|| TokenId::from(data.tokenId));
        Ok(TransferEvent {
            transfer_id: format!("0x{}", hex::encode(data.lockId)),
            source: ChainId::Unit0(self.chain_id),
            destination: ChainId::Waves(self.waves_network),
            token: format!("0x{}", hex::encode(data.token)),
            amount: TokenAmount(data.amount),
            sender: format!("0x{}", hex::encode(data.sender)),
            recipient: data.wavesDestination.clone(),
            kind,
            token_id,
            src_block: block,
            src_tx: tx_hash,
            observed_at: UnixMillis::now(),
        })
    }

    // ---- bridge read surface ----

    pub async fn waves_to_unit0_token(&self, asset_id: &str) -> Result<Address, Unit0Error> {
        let bridge = IUnit0Bridge::new(self.bridge, &self.provider);
        Ok(bridge
            .wavesToUnit0Token(asset_id.to_string())
            .call()
            .await?)
    }

    pub async fn processed(&self, transfer_id: B256) -> Result<bool, Unit0Error> {
        let bridge = IUnit0Bridge::new(self.bridge, &self.provider);
        Ok(bridge.processedTransfers(transfer_id).call().await?)
    }

    pub async fn validator_threshold(&self) -> Result<u32, Unit0Error> {
        let bridge = IUnit0Bridge::new(self.bridge, &self.provider);
        let threshold = bridge.validatorThreshold().call().await?;
        Ok(u32::try_from(threshold).unwrap_or(u32::MAX))
    }

    pub async fn active_validator_count(&self) -> Result<u32, Unit0Error> {
        let bridge = IUnit0Bridge::new(self.bridge, &self.provider);
        let count = bridge.activeValidatorCount().call().await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn is_validator(&self, validator: &str) -> Result<bool, Unit0Error> {
        let Ok(address) = Address::from_str(validator) else {
            return Ok(false);
        };
        let bridge = IUnit0Bridge::new(self.bridge, &self.provider);
        Ok(bridge.isValidator(address).call().await?)
    }

    // ---- bridge write surface ----

    /// Submit a release and wait for its receipt. Returns the tx hash.
    pub async fn submit_release(&self, release: &Unit0Release) -> Result<String, Unit0Error> {
        let bridge = IUnit0Bridge::new(self.bridge, &self.provider);
        if release.kind.is_non_fungible() {
            let call = bridge.releaseNFT(
                release.transfer_id,
                release.token,
                release.recipient,
                release.token_id,
                release.signatures.clone(),
            );
            let gas = call.estimate_gas().await?;
            let pending = call.gas(with_headroom(gas)).send().await?;
            let receipt = pending.get_receipt().await?;
            if !receipt.status() {
                return Err(Unit0Error::Reverted(format!(
                    "0x{}",
                    hex::encode(receipt.transaction_hash)
                )));
            }
            Ok(format!("0x{}", hex::encode(receipt.transaction_hash)))
        } else {
            let call = bridge.releaseTokens(
                release.transfer_id,
                release.token,
                release.amount,
                release.recipient,
                release.kind.as_u8(),
                release.token_id,
                release.signatures.clone(),
            );
            let gas = call.estimate_gas().await?;
            let pending = call.gas(with_headroom(gas)).send().await?;
            let receipt = pending.get_receipt().await?;
            if !receipt.status() {
                return Err(Unit0Error::Reverted(format!(
                    "0x{}",
                    hex::encode(receipt.transaction_hash)
                )));
            }
            Ok(format!("0x{}", hex::encode(receipt.transaction_hash)))
        }
    }
}

/// Gas estimate plus 20%.
fn with_headroom(gas: u64) -> u64 {
    gas.saturating_mul(120) / 100
}
