//! Off-chain validator node for the Waves ↔ Unit Zero token bridge.
//!
//! A replicated daemon, one of an M-of-N permissioned signer set. Each
//! node watches both chains for bridge lock events past finality, signs a
//! chain-specific attestation for every transfer, gossips attestations to
//! its peers, and — once the destination bridge's quorum of distinct
//! signatures is collected — relays the release transaction.
//!
//! # Modules
//!
//! - [`types`] — transfer events, attestations, records, chain ids.
//! - [`config`] — node options from file and environment.
//! - [`store`] — sled-backed persistence; the only durable artifact.
//! - [`signing`] — secp256k1 (Unit0) and ed25519 (Waves) attestations.
//! - [`chain`] — RPC/REST clients for both chains.
//! - [`watcher`] — finality-aware polling of source chains.
//! - [`resolver`] — asset-id ↔ token-address mapping.
//! - [`gossip`] — libp2p gossipsub overlay.
//! - [`relay`] — quorum release submission.
//! - [`coordinator`] — the event loop that owns record state.
//! - [`backend`] — production wiring of the coordinator's chain surface.
//! - [`handlers`] — read-only status HTTP endpoints.

pub mod backend;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod gossip;
pub mod handlers;
pub mod relay;
pub mod resolver;
pub mod signing;
pub mod store;
pub mod types;
pub mod watcher;
