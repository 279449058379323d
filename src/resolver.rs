//! Asset resolution between the two sides of the bridge.
//!
//! A pure lookup surface: given a source-side token string it produces the
//! destination-side reference the release verifier expects. It never signs
//! and never writes persistence.
//!
//! - Waves → Unit0: `wavesToUnit0Token(asset_id)` on the Unit0 bridge; a
//!   zero address means the asset was never registered.
//! - Unit0 → Waves: scan of the Waves bridge's `token_map_*` data rows.
//!   Each row value is `unit0_address|decimals|name|symbol` and the key
//!   suffix is the Waves asset id.
//!
//! Results are cached in-process; a miss forces one rescan.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::sync::Arc;

use crate::chain::unit0::Unit0Client;
use crate::chain::waves::{DataValue, WavesClient};
use crate::types::{ChainId, TransferEvent};

const TOKEN_MAP_PREFIX: &str = "token_map_";

/// Destination-side reference of a resolved asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 20-byte token address on the Unit0 side.
    Unit0Token(Address),
    /// Base58 asset id (or `WAVES`) on the Waves side.
    WavesAsset(String),
}

/// A parsed `token_map_*` registration row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMapping {
    pub waves_asset_id: String,
    pub unit0_address: String,
    pub decimals: u8,
    pub name: String,
    pub symbol: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No destination registration for token {token} towards {destination}")]
    NotRegistered { token: String, destination: ChainId },
    #[error("Resolver lookup failed: {0}")]
    Upstream(String),
    #[error("Resolver lookup failed (transient): {0}")]
    UpstreamTransient(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::UpstreamTransient(_))
    }
}

/// Maps source tokens to destination references, with an in-process cache.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    unit0: Arc<Unit0Client>,
    waves: Arc<WavesClient>,
    cache: Arc<DashMap<String, Resolution>>,
}

impl AssetResolver {
    pub fn new(unit0: Arc<Unit0Client>, waves: Arc<WavesClient>) -> Self {
        AssetResolver {
            unit0,
            waves,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Resolve the destination reference for `event`.
    pub async fn resolve(&self, event: &TransferEvent) -> Result<Resolution, ResolveError> {
        let cache_key = format!("{}|{}", event.destination.namespace(), event.token);
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(hit.clone());
        }
        let resolution = match event.destination {
            ChainId::Unit0(_) => self.resolve_towards_unit0(&event.token).await?,
            ChainId::Waves(_) => self.resolve_towards_waves(event).await?,
        };
        self.cache.insert(cache_key, resolution.clone());
        Ok(resolution)
    }

    async fn resolve_towards_unit0(&self, asset_id: &str) -> Result<Resolution, ResolveError> {
        let address = self
            .unit0
            .waves_to_unit0_token(asset_id)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    ResolveError::UpstreamTransient(e.to_string())
                } else {
                    ResolveError::Upstream(e.to_string())
                }
            })?;
        if address.is_zero() {
            return Err(ResolveError::NotRegistered {
                token: asset_id.to_string(),
                destination: self.unit0.chain(),
            });
        }
        Ok(Resolution::Unit0Token(address))
    }

    async fn resolve_towards_waves(&self, event: &TransferEvent) -> Result<Resolution, ResolveError> {
        let mapping = self
            .find_mapping(&event.token)
            .await?
            .ok_or_else(|| ResolveError::NotRegistered {
                token: event.token.clone(),
                destination: event.destination,
            })?;
        tracing::debug!(
            token = %event.token,
            asset = %mapping.waves_asset_id,
            decimals = mapping.decimals,
            name = %mapping.name,
            symbol = %mapping.symbol,
            "Resolved unit0 token to its waves registration"
        );
        Ok(Resolution::WavesAsset(mapping.waves_asset_id))
    }

    /// The full registration for a Unit0 token, if any. Also used at
    /// startup to warn about decimal mismatches.
    pub async fn find_mapping(
        &self,
        unit0_token: &str,
    ) -> Result<Option<TokenMapping>, ResolveError> {
        let wanted = unit0_token.to_lowercase();
        let entries = self
            .waves
            .data_entries(&format!("{TOKEN_MAP_PREFIX}.*"))
            .await
            .map_err(|e| {
                if e.is_transient() {
                    ResolveError::UpstreamTransient(e.to_string())
                } else {
                    ResolveError::Upstream(e.to_string())
                }
            })?;
        for entry in entries {
            let DataValue::String(value) = &entry.value else {
                continue;
            };
            if let Some(mapping) = parse_token_map_row(&entry.key, value) {
                if mapping.unit0_address.to_lowercase() == wanted {
                    return Ok(Some(mapping));
                }
            } else {
                tracing::warn!(key = %entry.key, "Skipping unparseable token_map row");
            }
        }
        Ok(None)
    }
}

/// Parse one `token_map_<assetId>` row.
///
/// The canonical value shape is `unit0_address|decimals|name|symbol`; rows
/// with extra trailing fields are tolerated by taking the leading four.
pub fn parse_token_map_row(key: &str, value: &str) -> Option<TokenMapping> {
    let waves_asset_id = key.strip_prefix(TOKEN_MAP_PREFIX)?;
    if waves_asset_id.is_empty() {
        return None;
    }
    let mut fields = value.split('|');
    let unit0_address = fields.next()?.trim();
    let decimals = fields.next()?.trim().parse::<u8>().ok()?;
    let name = fields.next()?.trim();
    let symbol = fields.next()?.trim();
    if unit0_address.is_empty() || !unit0_address.starts_with("0x") {
        return None;
    }
    Some(TokenMapping {
        waves_asset_id: waves_asset_id.to_string(),
        unit0_address: unit0_address.to_string(),
        decimals,
        name: name.to_string(),
        symbol: symbol.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_row() {
        let mapping = parse_token_map_row(
            "token_map_9xAssetId",
            "0x4025A8Ee89DAead315de690f0C250caB5309a115|8|Wrapped Waves|WWAVES",
        )
        .unwrap();
        assert_eq!(mapping.waves_asset_id, "9xAssetId");
        assert_eq!(
            mapping.unit0_address,
            "0x4025A8Ee89DAead315de690f0C250caB5309a115"
        );
        assert_eq!(mapping.decimals, 8);
        assert_eq!(mapping.name, "Wrapped Waves");
        assert_eq!(mapping.symbol, "WWAVES");
    }

    #[test]
    fn test_parse_tolerates_trailing_fields() {
        // Some historical registrations carry extra fields; the leading
        // four are authoritative.
        let mapping =
            parse_token_map_row("token_map_WAVES", "0xdead00000000000000000000|8|Waves|WAVES|1")
                .unwrap();
        assert_eq!(mapping.symbol, "WAVES");
        assert_eq!(mapping.decimals, 8);
    }

    #[test]
    fn test_parse_rejects_malformed_rows() {
        assert!(parse_token_map_row("token_map_", "0xdead|8|n|s").is_none());
        assert!(parse_token_map_row("other_key", "0xdead|8|n|s").is_none());
        assert!(parse_token_map_row("token_map_x", "no-pipes-here").is_none());
        assert!(parse_token_map_row("token_map_x", "0xdead|not-a-number|n|s").is_none());
        assert!(parse_token_map_row("token_map_x", "dead-no-prefix|8|n|s").is_none());
        assert!(parse_token_map_row("token_map_x", "0xdead|8|name-only").is_none());
    }
}
