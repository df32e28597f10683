use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::HeaderMap,
};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ApiError;
use crate::ingest::{self, IngestBatch};
use crate::query::{self, LatestReading};
use crate::store::SharedStore;
use crate::types::{DeviceRecord, IngestResp, StatusResp};

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub max_body_bytes: usize,
}

fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

// Storage drivers are synchronous; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("storage task failed: {e}")))?
}

pub async fn root() -> Json<StatusResp> {
    Json(StatusResp { status: "running" })
}

pub async fn health() -> Json<StatusResp> {
    Json(StatusResp { status: "alive" })
}

pub async fn telemetry(
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<StatusResp>, ApiError> {
    let request_id = request_id(&headers);
    let Json(body) = payload?;
    tracing::info!(%request_id, payload = %body, "telemetry received");
    Ok(Json(StatusResp { status: "ok" }))
}

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<IngestResp>, ApiError> {
    let request_id = request_id(&headers).to_string();
    let Json(body) = payload?;

    let batch = IngestBatch::from_payload(body).inspect_err(|e| {
        tracing::warn!(%request_id, error = %e, "ingest rejected");
    })?;
    tracing::info!(
        %request_id,
        device_id = %batch.device_id,
        records = batch.rows.len(),
        "ingest request"
    );

    let store = state.store.clone();
    let receipt = blocking(move || ingest::ingest(store.as_ref(), batch)).await?;
    Ok(Json(IngestResp {
        status: "ok",
        inserted: receipt.inserted,
        device: receipt.device,
    }))
}

pub async fn devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceRecord>>, ApiError> {
    let store = state.store.clone();
    let devices = blocking(move || Ok(query::list_devices(store.as_ref())?)).await?;
    Ok(Json(devices))
}

pub async fn last(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Result<Json<LatestReading>, ApiError> {
    let request_id = request_id(&headers).to_string();
    let store = state.store.clone();
    let lookup_id = device_id.clone();
    let latest =
        blocking(move || Ok(query::latest_measurement(store.as_ref(), &lookup_id)?)).await?;
    if latest == LatestReading::NoData {
        tracing::info!(%request_id, %device_id, "no measurements for device");
    }
    Ok(Json(latest))
}
