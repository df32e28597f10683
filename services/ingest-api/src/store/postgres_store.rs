use std::time::Duration;

use postgres::{NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use time::OffsetDateTime;

use super::{StoreConfig, StoreError, TelemetryStore};
use crate::types::{DeviceKey, DeviceRecord, MeasurementRow, ResolvedDevice};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
    id          BIGSERIAL PRIMARY KEY,
    device_id   TEXT        NOT NULL UNIQUE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS measurements (
    id            BIGSERIAL PRIMARY KEY,
    device_id     BIGINT NOT NULL REFERENCES devices (id),
    timestamp     BIGINT,
    timestamp_iso TEXT,
    accel_x       DOUBLE PRECISION NOT NULL,
    accel_y       DOUBLE PRECISION NOT NULL,
    accel_z       DOUBLE PRECISION NOT NULL,
    gyro_x        DOUBLE PRECISION NOT NULL,
    gyro_y        DOUBLE PRECISION NOT NULL,
    gyro_z        DOUBLE PRECISION NOT NULL,
    mag_x         DOUBLE PRECISION NOT NULL,
    mag_y         DOUBLE PRECISION NOT NULL,
    mag_z         DOUBLE PRECISION NOT NULL,
    light         DOUBLE PRECISION,
    lat           DOUBLE PRECISION NOT NULL,
    long          DOUBLE PRECISION NOT NULL,
    speed         DOUBLE PRECISION NOT NULL,
    mic_level     DOUBLE PRECISION,
    pressure      DOUBLE PRECISION NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_measurements_device_timestamp
    ON measurements (device_id, timestamp);
";

const INSERT_MEASUREMENT: &str = "INSERT INTO measurements (device_id, timestamp, timestamp_iso, \
     accel_x, accel_y, accel_z, gyro_x, gyro_y, gyro_z, mag_x, mag_y, mag_z, light, lat, long, \
     speed, mic_level, pressure) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
     $14, $15, $16, $17, $18)";

const SELECT_LATEST: &str = "SELECT m.timestamp, m.timestamp_iso, m.accel_x, m.accel_y, \
     m.accel_z, m.gyro_x, m.gyro_y, m.gyro_z, m.mag_x, m.mag_y, m.mag_z, m.light, m.lat, m.long, \
     m.speed, m.mic_level, m.pressure FROM measurements m JOIN devices d ON d.id = m.device_id \
     WHERE d.device_id = $1 ORDER BY m.timestamp DESC NULLS LAST, m.id DESC LIMIT 1";

type PgPool = Pool<PostgresConnectionManager<NoTls>>;
type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

/// Pooled Postgres backend. Each operation checks a connection out and hands
/// it back when the guard drops.
pub struct PostgresStore {
    pool: Option<PgPool>,
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        // the sync driver owns a runtime; never tear it down on an async worker
        if let Some(pool) = self.pool.take() {
            let _ = std::thread::spawn(move || drop(pool));
        }
    }
}

impl PostgresStore {
    /// Builds the pool and creates the schema if absent. Fails when the
    /// database cannot be reached within the connect timeout.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut pg_config = config
            .url
            .trim()
            .parse::<postgres::Config>()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        let options = format!("-c statement_timeout={}", config.statement_timeout_ms);
        pg_config.options(&options);
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(config.pool_max_size.max(1))
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool: Some(pool) };
        store.migrate()?;
        Ok(store)
    }

    fn connection(&self) -> Result<PgConnection, StoreError> {
        self.pool
            .as_ref()
            .ok_or_else(|| StoreError::Connection("postgres store closed".into()))?
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(SCHEMA).map_err(query_error)?;
        tracing::debug!("postgres schema ensured");
        Ok(())
    }
}

fn query_error(err: postgres::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

fn measurement_from_row(row: &Row) -> Result<MeasurementRow, StoreError> {
    let f = |idx: usize| row.try_get::<_, f64>(idx).map_err(|e| StoreError::Corrupt(e.to_string()));
    let opt = |idx: usize| {
        row.try_get::<_, Option<f64>>(idx)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    };
    Ok(MeasurementRow {
        timestamp: row
            .try_get(0)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        timestamp_iso: row
            .try_get(1)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        accel_x: f(2)?,
        accel_y: f(3)?,
        accel_z: f(4)?,
        gyro_x: f(5)?,
        gyro_y: f(6)?,
        gyro_z: f(7)?,
        mag_x: f(8)?,
        mag_y: f(9)?,
        mag_z: f(10)?,
        light: opt(11)?,
        lat: f(12)?,
        long: f(13)?,
        speed: f(14)?,
        mic_level: opt(15)?,
        pressure: f(16)?,
    })
}

impl TelemetryStore for PostgresStore {
    fn resolve_device(&self, external_id: &str) -> Result<ResolvedDevice, StoreError> {
        let mut conn = self.connection()?;
        let existing = conn
            .query_opt("SELECT id FROM devices WHERE device_id = $1", &[&external_id])
            .map_err(query_error)?;
        if let Some(row) = existing {
            return Ok(ResolvedDevice {
                key: DeviceKey(row.get(0)),
                created: false,
            });
        }

        let inserted = conn
            .query_opt(
                "INSERT INTO devices (device_id) VALUES ($1) ON CONFLICT (device_id) DO NOTHING \
                 RETURNING id",
                &[&external_id],
            )
            .map_err(query_error)?;
        if let Some(row) = inserted {
            return Ok(ResolvedDevice {
                key: DeviceKey(row.get(0)),
                created: true,
            });
        }

        // lost the race to a concurrent first sight; the winner's row is committed
        let row = conn
            .query_one("SELECT id FROM devices WHERE device_id = $1", &[&external_id])
            .map_err(query_error)?;
        Ok(ResolvedDevice {
            key: DeviceKey(row.get(0)),
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
        let mut conn = self.connection()?;
        let mut tx = conn.transaction().map_err(query_error)?;
        let stmt = tx.prepare(INSERT_MEASUREMENT).map_err(query_error)?;
        for row in rows {
            tx.execute(
                &stmt,
                &[
                    &device.0,
                    &row.timestamp,
                    &row.timestamp_iso,
                    &row.accel_x,
                    &row.accel_y,
                    &row.accel_z,
                    &row.gyro_x,
                    &row.gyro_y,
                    &row.gyro_z,
                    &row.mag_x,
                    &row.mag_y,
                    &row.mag_z,
                    &row.light,
                    &row.lat,
                    &row.long,
                    &row.speed,
                    &row.mic_level,
                    &row.pressure,
                ],
            )
            .map_err(query_error)?;
        }
        tx.commit().map_err(query_error)?;
        Ok(rows.len())
    }

    fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn
            .query("SELECT device_id, created_at FROM devices ORDER BY id", &[])
            .map_err(query_error)?;
        rows.iter()
            .map(|row| {
                let created_at: OffsetDateTime = row
                    .try_get(1)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(DeviceRecord {
                    external_id: row.get(0),
                    created_at,
                })
            })
            .collect()
    }

    fn latest_measurement(
        &self,
        external_id: &str,
    ) -> Result<Option<MeasurementRow>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn
            .query_opt(SELECT_LATEST, &[&external_id])
            .map_err(query_error)?;
        row.as_ref().map(measurement_from_row).transpose()
    }
}
