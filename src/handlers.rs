//! Read-only status HTTP surface.
//!
//! Out of the critical path: every endpoint reads the store or shared
//! snapshots and never mutates anything. All responses are JSON with
//! amounts as decimal strings.
//!
//! - `GET /health` – liveness
//! - `GET /status` – identity, watermarks, peers, last fault
//! - `GET /stats` – per-status transfer counts
//! - `GET /transfers/pending` – open transfers
//! - `GET /transfers/{id}` – one record (bare id or `namespace:id`)
//! - `GET /transfers/{id}/attestations` – its attestations
//! - `GET /validators` – destination validator sets and peer counters

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::coordinator::NodeStatus;
use crate::gossip::GossipHandle;
use crate::store::{Store, StoreError};
use crate::types::{TransferRecord, UnixMillis};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub status: Arc<NodeStatus>,
    pub gossip: Option<GossipHandle>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/transfers/pending", get(get_pending_transfers))
        .route("/transfers/{id}", get(get_transfer))
        .route("/transfers/{id}/attestations", get(get_attestations))
        .route("/validators", get(get_validators))
        .with_state(state)
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "Status endpoint store failure");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": self.0.to_string()})),
        )
            .into_response()
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

/// Look a record up by `namespace:id` or bare transfer id.
fn lookup(store: &Store, id: &str) -> Result<Option<TransferRecord>, StoreError> {
    if id.contains(':') {
        return store.get_transfer(id);
    }
    for namespace in ["waves", "unit0"] {
        if let Some(record) = store.get_transfer(&format!("{namespace}:{id}"))? {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

#[instrument(skip_all)]
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_ms = state.status.started_at.saturating_age_ms(UnixMillis::now());
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": uptime_ms.to_string(),
    }))
}

#[instrument(skip_all)]
async fn get_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let last_fault = state
        .status
        .last_fault
        .read()
        .expect("status lock")
        .clone();
    let body = json!({
        "unit0_validator_id": state.status.unit0_validator_id,
        "waves_validator_id": state.status.waves_validator_id,
        "started_at": state.status.started_at,
        "watermarks": {
            "waves": state.store.get_watermark("waves")?,
            "unit0": state.store.get_watermark("unit0")?,
        },
        "gossip_peers": state.gossip.as_ref().map(GossipHandle::peer_count).unwrap_or(0),
        "last_fault": last_fault,
    });
    Ok(Json(body).into_response())
}

#[instrument(skip_all)]
async fn get_stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.store.get_stats()?;
    Ok(Json(stats).into_response())
}

#[instrument(skip_all)]
async fn get_pending_transfers(State(state): State<AppState>) -> Result<Response, ApiError> {
    let open = state.store.list_open_transfers()?;
    Ok(Json(open).into_response())
}

#[instrument(skip_all)]
async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match lookup(&state.store, &id)? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(not_found("transfer")),
    }
}

#[instrument(skip_all)]
async fn get_attestations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match lookup(&state.store, &id)? {
        Some(record) => Ok(Json(record.attestations).into_response()),
        None => Ok(not_found("transfer")),
    }
}

#[instrument(skip_all)]
async fn get_validators(State(state): State<AppState>) -> Result<Response, ApiError> {
    let sets = state
        .status
        .validator_sets
        .read()
        .expect("status lock")
        .clone();
    let counters = state.store.validator_counters()?;
    Ok(Json(json!({
        "sets": sets,
        "counters": counters,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, TokenAmount, TokenKind, TransferEvent};

    fn state() -> AppState {
        let store = Store::temporary();
        AppState {
            store,
            status: Arc::new(NodeStatus::new("0xself".into(), None)),
            gossip: None,
        }
    }

    fn sample_event(id: &str) -> TransferEvent {
        TransferEvent {
            transfer_id: id.to_string(),
            source: ChainId::Waves(b'W'),
            destination: ChainId::Unit0(88811),
            token: "WAVES".into(),
            amount: TokenAmount::from(123u64),
            sender: "3PSender".into(),
            recipient: "0xabcdabcdabcdabcdabcdabcdabcdabcdabcd0001".into(),
            kind: TokenKind::FungibleExternal,
            token_id: None,
            src_block: 5,
            src_tx: id.to_string(),
            observed_at: UnixMillis(1),
        }
    }

    #[test]
    fn test_lookup_accepts_bare_and_qualified_ids() {
        let state = state();
        state
            .store
            .put_transfer_if_absent(&sample_event("abc"))
            .unwrap();
        assert!(lookup(&state.store, "waves:abc").unwrap().is_some());
        assert!(lookup(&state.store, "abc").unwrap().is_some());
        assert!(lookup(&state.store, "unit0:abc").unwrap().is_none());
        assert!(lookup(&state.store, "missing").unwrap().is_none());
    }

    #[test]
    fn test_amounts_render_as_decimal_strings() {
        let state = state();
        state
            .store
            .put_transfer_if_absent(&sample_event("amt"))
            .unwrap();
        let record = lookup(&state.store, "amt").unwrap().unwrap();
        let body = serde_json::to_value(&record).unwrap();
        assert_eq!(body["event"]["amount"], "123");
    }
}
