use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Number, Value};
use time::OffsetDateTime;

// Incoming payload for HTTP POST /ingest. Records stay raw here so each one can
// be validated on its own and reported by index.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub metadata: IngestMetadata,
    pub records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct IngestMetadata {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

// One entry of `records`.
#[derive(Debug, Deserialize)]
pub struct RecordIn {
    #[serde(default, deserialize_with = "epoch_millis")]
    pub timestamp: Option<i64>,
    #[serde(rename = "timestampISO")]
    pub timestamp_iso: Option<String>,
    pub data: SensorData,
}

// Epoch millis. Some clients emit them as doubles (`1697450000123.0`); those are
// taken as long as no fraction is lost.
fn epoch_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(n) = Option::<Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Some(v) = n.as_i64() {
        return Ok(Some(v));
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Ok(Some(f as i64))
        }
        _ => Err(de::Error::custom(format!(
            "timestamp {n} is not a whole number of milliseconds"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Location {
    pub lat: f64,
    pub long: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Barometer {
    pub pressure: f64,
}

/// Nested sensor object as devices send it and as `/last/{deviceId}` returns it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SensorData {
    pub accelerometer: Axes,
    pub gyroscope: Axes,
    pub magnetometer: Axes,
    pub light: Option<f64>,
    pub location: Location,
    #[serde(rename = "micLevel")]
    pub mic_level: Option<f64>,
    pub barometer: Barometer,
}

/// One measurement flattened to the `measurements` column layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub timestamp: Option<i64>,
    pub timestamp_iso: Option<String>,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub mag_x: f64,
    pub mag_y: f64,
    pub mag_z: f64,
    pub light: Option<f64>,
    pub lat: f64,
    pub long: f64,
    pub speed: f64,
    pub mic_level: Option<f64>,
    pub pressure: f64,
}

impl From<RecordIn> for MeasurementRow {
    fn from(record: RecordIn) -> Self {
        let data = record.data;
        Self {
            timestamp: record.timestamp,
            timestamp_iso: record.timestamp_iso,
            accel_x: data.accelerometer.x,
            accel_y: data.accelerometer.y,
            accel_z: data.accelerometer.z,
            gyro_x: data.gyroscope.x,
            gyro_y: data.gyroscope.y,
            gyro_z: data.gyroscope.z,
            mag_x: data.magnetometer.x,
            mag_y: data.magnetometer.y,
            mag_z: data.magnetometer.z,
            light: data.light,
            lat: data.location.lat,
            long: data.location.long,
            speed: data.location.speed,
            mic_level: data.mic_level,
            pressure: data.barometer.pressure,
        }
    }
}

impl MeasurementRow {
    /// Rebuilds the nested sensor object from the flat columns.
    pub fn sensor_data(&self) -> SensorData {
        SensorData {
            accelerometer: Axes {
                x: self.accel_x,
                y: self.accel_y,
                z: self.accel_z,
            },
            gyroscope: Axes {
                x: self.gyro_x,
                y: self.gyro_y,
                z: self.gyro_z,
            },
            magnetometer: Axes {
                x: self.mag_x,
                y: self.mag_y,
                z: self.mag_z,
            },
            light: self.light,
            location: Location {
                lat: self.lat,
                long: self.long,
                speed: self.speed,
            },
            mic_level: self.mic_level,
            barometer: Barometer {
                pressure: self.pressure,
            },
        }
    }
}

/// Internal numeric device id (`devices.id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub key: DeviceKey,
    pub created: bool,
}

// Row of GET /devices
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    #[serde(rename = "device_id")]
    pub external_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// Response body for POST /ingest
#[derive(Debug, Serialize)]
pub struct IngestResp {
    pub status: &'static str,
    pub inserted: usize,
    pub device: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResp {
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: Option<i64>,
    #[serde(rename = "timestampISO")]
    pub timestamp_iso: Option<String>,
    pub data: SensorData,
}

#[derive(Debug, Serialize)]
pub struct NoDataResp {
    pub error: &'static str,
}
