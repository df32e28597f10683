use serde::Serialize;

use crate::store::{StoreError, TelemetryStore};
use crate::types::{DeviceRecord, NoDataResp, Reading};

pub const NO_DATA: &str = "No data found";

/// Outcome of a latest-reading lookup. `NoData` is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LatestReading {
    Found(Reading),
    NoData,
}

impl Serialize for LatestReading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LatestReading::Found(reading) => reading.serialize(serializer),
            LatestReading::NoData => NoDataResp { error: NO_DATA }.serialize(serializer),
        }
    }
}

pub fn list_devices(store: &dyn TelemetryStore) -> Result<Vec<DeviceRecord>, StoreError> {
    store.list_devices()
}

pub fn latest_measurement(
    store: &dyn TelemetryStore,
    external_id: &str,
) -> Result<LatestReading, StoreError> {
    let latest = store
        .latest_measurement(external_id)?
        .map(|row| {
            let data = row.sensor_data();
            Reading {
                device_id: external_id.to_string(),
                timestamp: row.timestamp,
                timestamp_iso: row.timestamp_iso,
                data,
            }
        })
        .map_or(LatestReading::NoData, LatestReading::Found);
    Ok(latest)
}
