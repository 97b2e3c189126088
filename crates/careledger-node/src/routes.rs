use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use careledger_core::{
    anchors::{AnchorRequest, ConsentAnchor, IntoAnchor, MedicalRecordAnchor, PrescriptionAnchor},
    chain::AnchorContext,
    query::TransactionFilter,
    RecordType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{auth::Actor, error::ApiError, AppState};

type ApiResult<T> = Result<T, ApiError>;

/// Runs a synchronous chain read on the blocking pool.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> careledger_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| {
            careledger_core::LedgerError::unavailable(format!("worker task failed: {err}"))
        })?
        .map_err(ApiError::from)
}

#[derive(Serialize)]
pub struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success { success: true, body })
}

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<Success<Value>>> {
    let chain = state.chain.clone();
    let stats = blocking(move || chain.get_chain_stats()).await?;
    Ok(ok(json!({ "stats": stats })))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(data_hash): Path<String>,
) -> ApiResult<Json<Success<careledger_core::chain::RecordVerification>>> {
    let chain = state.chain.clone();
    let data_hash = data_hash.trim().to_lowercase();
    let verification = blocking(move || chain.verify_record(&data_hash)).await?;
    Ok(ok(verification))
}

pub async fn integrity(
    State(state): State<AppState>,
) -> ApiResult<Json<Success<careledger_core::chain::IntegrityReport>>> {
    let chain = state.chain.clone();
    let report = blocking(move || chain.verify_chain_integrity()).await?;
    Ok(ok(report))
}

pub async fn block_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Success<Value>>> {
    let chain = state.chain.clone();
    let block = blocking(move || chain.get_block_by_hash(&hash)).await?;
    Ok(ok(json!({ "block": block })))
}

pub async fn block_by_number(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> ApiResult<Json<Success<Value>>> {
    let chain = state.chain.clone();
    let block = blocking(move || chain.get_block_by_number(number)).await?;
    Ok(ok(json!({ "block": block })))
}

/// Raw query strings; empty values mean "not given".
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionQuery {
    record_type: Option<String>,
    actor_id: Option<String>,
    subject_id: Option<String>,
    search: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_count(name: &str, value: Option<String>) -> ApiResult<Option<usize>> {
    non_empty(value)
        .map(|v| {
            v.parse::<usize>().map_err(|_| {
                ApiError::bad_request(format!("{name} must be a non-negative integer"))
            })
        })
        .transpose()
}

impl TransactionQuery {
    fn into_parts(self) -> ApiResult<(TransactionFilter, Option<usize>, Option<usize>)> {
        let record_type = non_empty(self.record_type)
            .map(|v| v.parse::<RecordType>())
            .transpose()?;
        let filter = TransactionFilter {
            record_type,
            actor_id: non_empty(self.actor_id),
            subject_id: non_empty(self.subject_id),
            search: non_empty(self.search),
        };
        let page = parse_count("page", self.page)?;
        let page_size = parse_count("pageSize", self.page_size)?;
        Ok((filter, page, page_size))
    }
}

pub async fn transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionQuery>,
) -> ApiResult<Json<Success<careledger_core::query::TransactionPage>>> {
    let (filter, page, page_size) = query.into_parts()?;
    debug!(?filter, "listing transactions");
    let chain = state.chain.clone();
    let listing = blocking(move || chain.list_transactions(&filter, page, page_size)).await?;
    Ok(ok(listing))
}

/// Same listing restricted to blocks anchored by the caller.
pub async fn my_transactions(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<TransactionQuery>,
) -> ApiResult<Json<Success<careledger_core::query::TransactionPage>>> {
    let (mut filter, page, page_size) = query.into_parts()?;
    filter.actor_id = Some(actor.id().to_string());
    let chain = state.chain.clone();
    let listing = blocking(move || chain.list_transactions(&filter, page, page_size)).await?;
    Ok(ok(listing))
}

pub async fn record_history(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> ApiResult<Json<Success<Value>>> {
    let chain = state.chain.clone();
    let blocks = blocking(move || chain.get_record_history(&record_id)).await?;
    Ok(ok(json!({ "total": blocks.len(), "blocks": blocks })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorBody {
    record_type: String,
    record_id: String,
    data: Value,
    subject_id: Option<String>,
    summary: Option<String>,
    /// Free-form; non-string values are stored as their JSON text.
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    block_number: u64,
    hash: String,
    data_hash: String,
    record_type: RecordType,
    timestamp: DateTime<Utc>,
}

pub async fn anchor(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<AnchorBody>,
) -> ApiResult<(StatusCode, Json<Success<Value>>)> {
    let record_type: RecordType = body.record_type.parse()?;
    if body.record_id.trim().is_empty() {
        return Err(ApiError::bad_request("recordId must not be empty"));
    }
    let context = AnchorContext {
        actor_id: Some(actor.id().to_string()),
        subject_id: non_empty(body.subject_id),
        summary: non_empty(body.summary),
        metadata: flatten_metadata(body.metadata),
    };
    let request = AnchorRequest::new(record_type, body.record_id, body.data).with_context(context);

    let block = tokio::time::timeout(state.request_timeout, state.anchors.anchor(request))
        .await
        .map_err(|_| ApiError::timeout())??;

    let receipt = AnchorReceipt {
        block_number: block.block_number,
        hash: block.hash,
        data_hash: block.data_hash,
        record_type: block.record_type,
        timestamp: block.timestamp,
    };
    Ok((
        StatusCode::CREATED,
        ok(json!({ "message": "Record anchored", "block": receipt })),
    ))
}

fn flatten_metadata(metadata: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    metadata
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(text) => (key, text),
            other => (key, other.to_string()),
        })
        .collect()
}

fn queued(accepted: bool) -> ApiResult<(StatusCode, Json<Success<Value>>)> {
    if !accepted {
        return Err(careledger_core::LedgerError::unavailable("anchor queue is full").into());
    }
    Ok((StatusCode::ACCEPTED, ok(json!({ "queued": true }))))
}

pub async fn anchor_prescription(
    State(state): State<AppState>,
    actor: Actor,
    Json(rx): Json<PrescriptionAnchor>,
) -> ApiResult<(StatusCode, Json<Success<Value>>)> {
    queued(state.anchors.submit(rx.into_anchor(Some(actor.id().to_string()))))
}

pub async fn anchor_medical_record(
    State(state): State<AppState>,
    actor: Actor,
    Json(record): Json<MedicalRecordAnchor>,
) -> ApiResult<(StatusCode, Json<Success<Value>>)> {
    queued(state.anchors.submit(record.into_anchor(Some(actor.id().to_string()))))
}

pub async fn anchor_consent(
    State(state): State<AppState>,
    actor: Actor,
    Json(consent): Json<ConsentAnchor>,
) -> ApiResult<(StatusCode, Json<Success<Value>>)> {
    queued(state.anchors.submit(consent.into_anchor(Some(actor.id().to_string()))))
}
