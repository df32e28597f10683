use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{StoreError, TelemetryStore};
use crate::types::{DeviceKey, DeviceRecord, MeasurementRow, ResolvedDevice};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE TABLE IF NOT EXISTS measurements (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id     INTEGER NOT NULL REFERENCES devices (id),
    timestamp     INTEGER,
    timestamp_iso TEXT,
    accel_x       REAL NOT NULL,
    accel_y       REAL NOT NULL,
    accel_z       REAL NOT NULL,
    gyro_x        REAL NOT NULL,
    gyro_y        REAL NOT NULL,
    gyro_z        REAL NOT NULL,
    mag_x         REAL NOT NULL,
    mag_y         REAL NOT NULL,
    mag_z         REAL NOT NULL,
    light         REAL,
    lat           REAL NOT NULL,
    long          REAL NOT NULL,
    speed         REAL NOT NULL,
    mic_level     REAL,
    pressure      REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_measurements_device_timestamp
    ON measurements (device_id, timestamp);
";

const INSERT_MEASUREMENT: &str = "INSERT INTO measurements (device_id, timestamp, timestamp_iso, \
     accel_x, accel_y, accel_z, gyro_x, gyro_y, gyro_z, mag_x, mag_y, mag_z, light, lat, long, \
     speed, mic_level, pressure) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
     ?14, ?15, ?16, ?17, ?18)";

const SELECT_LATEST: &str = "SELECT m.timestamp, m.timestamp_iso, m.accel_x, m.accel_y, \
     m.accel_z, m.gyro_x, m.gyro_y, m.gyro_z, m.mag_x, m.mag_y, m.mag_z, m.light, m.lat, m.long, \
     m.speed, m.mic_level, m.pressure FROM measurements m JOIN devices d ON d.id = m.device_id \
     WHERE d.device_id = ?1 ORDER BY m.timestamp DESC NULLS LAST, m.id DESC LIMIT 1";

/// Embedded backend: one connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(connection_error)?;
        Self::init(conn, false)
    }

    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(connection_error)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .map_err(connection_error)?;
        Self::init(conn, true)
    }

    fn init(conn: Connection, wal: bool) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(connection_error)?;
        if wal {
            conn.execute_batch("PRAGMA journal_mode = wal;")
                .map_err(connection_error)?;
        }
        conn.execute_batch(SCHEMA).map_err(query_error)?;
        tracing::debug!("sqlite schema ensured");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Connection("sqlite connection mutex poisoned".into()))
    }
}

fn connection_error(err: rusqlite::Error) -> StoreError {
    StoreError::Connection(err.to_string())
}

fn query_error(err: rusqlite::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<MeasurementRow> {
    Ok(MeasurementRow {
        timestamp: row.get(0)?,
        timestamp_iso: row.get(1)?,
        accel_x: row.get(2)?,
        accel_y: row.get(3)?,
        accel_z: row.get(4)?,
        gyro_x: row.get(5)?,
        gyro_y: row.get(6)?,
        gyro_z: row.get(7)?,
        mag_x: row.get(8)?,
        mag_y: row.get(9)?,
        mag_z: row.get(10)?,
        light: row.get(11)?,
        lat: row.get(12)?,
        long: row.get(13)?,
        speed: row.get(14)?,
        mic_level: row.get(15)?,
        pressure: row.get(16)?,
    })
}

impl TelemetryStore for SqliteStore {
    fn resolve_device(&self, external_id: &str) -> Result<ResolvedDevice, StoreError> {
        let conn = self.lock()?;
        let select = |conn: &Connection| {
            conn.query_row(
                "SELECT id FROM devices WHERE device_id = ?1",
                params![external_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(query_error)
        };
        if let Some(id) = select(&*conn)? {
            return Ok(ResolvedDevice {
                key: DeviceKey(id),
                created: false,
            });
        }

        let changed = conn
            .execute(
                "INSERT INTO devices (device_id) VALUES (?1) ON CONFLICT (device_id) DO NOTHING",
                params![external_id],
            )
            .map_err(query_error)?;
        if changed == 1 {
            return Ok(ResolvedDevice {
                key: DeviceKey(conn.last_insert_rowid()),
                created: true,
            });
        }

        // another connection to the same file inserted it first
        let id = select(&*conn)?.ok_or_else(|| {
            StoreError::Corrupt(format!("device '{external_id}' vanished after conflict"))
        })?;
        Ok(ResolvedDevice {
            key: DeviceKey(id),
            created: false,
        })
    }

    fn insert_measurements(
        &self,
        device: DeviceKey,
        rows: &[MeasurementRow],
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_error)?;
        {
            let mut stmt = tx.prepare_cached(INSERT_MEASUREMENT).map_err(query_error)?;
            for row in rows {
                stmt.execute(params![
                    device.0,
                    row.timestamp,
                    row.timestamp_iso,
                    row.accel_x,
                    row.accel_y,
                    row.accel_z,
                    row.gyro_x,
                    row.gyro_y,
                    row.gyro_z,
                    row.mag_x,
                    row.mag_y,
                    row.mag_z,
                    row.light,
                    row.lat,
                    row.long,
                    row.speed,
                    row.mic_level,
                    row.pressure,
                ])
                .map_err(query_error)?;
            }
        }
        tx.commit().map_err(query_error)?;
        Ok(rows.len())
    }

    fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT device_id, created_at FROM devices ORDER BY id")
            .map_err(query_error)?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(query_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_error)?;
        raw.into_iter()
            .map(|(external_id, created_at)| {
                let created_at = OffsetDateTime::parse(&created_at, &Rfc3339).map_err(|e| {
                    StoreError::Corrupt(format!("created_at '{created_at}': {e}"))
                })?;
                Ok(DeviceRecord {
                    external_id,
                    created_at,
                })
            })
            .collect()
    }

    fn latest_measurement(
        &self,
        external_id: &str,
    ) -> Result<Option<MeasurementRow>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(SELECT_LATEST, params![external_id], measurement_from_row)
            .optional()
            .map_err(query_error)
    }
}
