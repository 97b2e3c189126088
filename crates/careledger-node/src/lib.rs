//! HTTP surface of the audit ledger.

use std::{sync::Arc, time::Duration};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use careledger_core::chain::Chain;
use careledger_storage::ChainStore;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod auth;
pub mod config;
pub mod constants;
pub mod error;
pub mod routes;
pub mod writer;

use writer::AnchorHandle;

#[derive(Clone)]
pub struct AppState {
    pub chain: Chain<dyn ChainStore>,
    pub anchors: AnchorHandle,
    pub api_token: Option<Arc<str>>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        chain: Chain<dyn ChainStore>,
        anchors: AnchorHandle,
        api_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            anchors,
            api_token: api_token.filter(|t| !t.is_empty()).map(Arc::from),
            request_timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/ledger/transactions", get(routes::transactions))
        .route("/ledger/my-transactions", get(routes::my_transactions))
        .route("/ledger/records/{record_id}", get(routes::record_history))
        .route("/ledger/anchor", post(routes::anchor))
        .route("/ledger/workflows/prescription", post(routes::anchor_prescription))
        .route("/ledger/workflows/medical-record", post(routes::anchor_medical_record))
        .route("/ledger/workflows/consent", post(routes::anchor_consent))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(routes::health))
        .route("/ledger/stats", get(routes::stats))
        .route("/ledger/verify/{data_hash}", get(routes::verify))
        .route("/ledger/integrity", get(routes::integrity))
        .route("/ledger/block/{hash}", get(routes::block_by_hash))
        .route("/ledger/blocks/{number}", get(routes::block_by_number))
        .merge(authenticated)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
