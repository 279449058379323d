//! Chain-specific clients.
//!
//! [`unit0`] speaks JSON-RPC to the EVM side through Alloy; [`waves`]
//! speaks the Waves node REST API through reqwest and carries the invoke
//! transaction codec used for releases. Both expose the narrow surface the
//! watchers, resolver, and relay engine consume; neither touches the store.

pub mod unit0;
pub mod waves;
