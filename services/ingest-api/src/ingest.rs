//! Ingest path: validate the payload shape, resolve the device, write the batch.
//!
//! The whole payload is validated before storage is touched. One bad record
//! rejects the batch and nothing is written, not even the device row.

use serde_json::Value;

use crate::error::ApiError;
use crate::registry;
use crate::store::TelemetryStore;
use crate::types::{IngestRequest, MeasurementRow, RecordIn};

/// A validated payload, ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestBatch {
    pub device_id: String,
    pub rows: Vec<MeasurementRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub inserted: usize,
    pub device: String,
}

impl IngestBatch {
    pub fn from_payload(payload: Value) -> Result<Self, ApiError> {
        let request: IngestRequest = serde_json::from_value(payload)
            .map_err(|e| ApiError::MalformedPayload(e.to_string()))?;

        // stored and echoed exactly as sent; it is the device's identity key
        let device_id = request.metadata.device_id;
        if device_id.trim().is_empty() {
            return Err(ApiError::MalformedPayload(
                "metadata.deviceId must not be empty".into(),
            ));
        }

        let rows = request
            .records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| {
                serde_json::from_value::<RecordIn>(record)
                    .map(MeasurementRow::from)
                    .map_err(|e| ApiError::MalformedPayload(format!("records[{idx}]: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { device_id, rows })
    }
}

/// Resolves the batch's device and writes every row in one transaction.
pub fn ingest(store: &dyn TelemetryStore, batch: IngestBatch) -> Result<IngestReceipt, ApiError> {
    let device = registry::resolve_device(store, &batch.device_id)?;
    let inserted = store.insert_measurements(device.key, &batch.rows)?;
    tracing::info!(device_id = %batch.device_id, inserted, "measurement batch stored");
    Ok(IngestReceipt {
        inserted,
        device: batch.device_id,
    })
}
