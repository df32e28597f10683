//! Relational storage for devices and measurements.
//!
//! Both backends are synchronous drivers; callers on the async side go through
//! `tokio::task::spawn_blocking`. Schema bootstrap runs once, in the backend
//! constructor.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::types::{DeviceKey, DeviceRecord, MeasurementRow, ResolvedDevice};

pub mod postgres_store;
pub mod sqlite_store;

pub use self::postgres_store::PostgresStore;
pub use self::sqlite_store::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage connection error: {0}")]
    Connection(String),
    #[error("storage query error: {0}")]
    Query(String),
    #[error("storage returned invalid data: {0}")]
    Corrupt(String),
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
}

pub trait TelemetryStore: Send + Sync {
    /// Returns the internal id for `external_id`, creating the device row on
    /// first sight. Concurrent callers for the same id converge on one row.
    fn resolve_device(&self, external_id: &str) -> Result<ResolvedDevice, StoreError>;

    /// Writes all rows for `device` in one transaction. Returns the row count.
    fn insert_measurements(
        &self,
        device: DeviceKey,
        rows: &[MeasurementRow],
    ) -> Result<usize, StoreError>;

    /// Every device, in creation order.
    fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Row with the greatest client timestamp for the device, joined through
    /// `devices.id`. `None` when the device is unknown or has no rows.
    fn latest_measurement(&self, external_id: &str)
    -> Result<Option<MeasurementRow>, StoreError>;
}

pub type SharedStore = Arc<dyn TelemetryStore>;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub connect_timeout_ms: u64,
    pub statement_timeout_ms: u64,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_max_size: 16,
            connect_timeout_ms: 5_000,
            statement_timeout_ms: 30_000,
        }
    }
}

/// Backend chosen from the scheme of a database url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    SqliteMemory,
    SqliteFile(String),
}

impl Backend {
    pub fn from_url(raw: &str) -> Result<Self, StoreError> {
        let raw = raw.trim();
        if raw == "sqlite::memory:" {
            return Ok(Backend::SqliteMemory);
        }
        if let Some(path) = raw.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(StoreError::UnsupportedUrl("sqlite url without a path".into()));
            }
            return Ok(Backend::SqliteFile(path.to_string()));
        }
        let url = Url::parse(raw).map_err(|e| StoreError::UnsupportedUrl(e.to_string()))?;
        match url.scheme() {
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(StoreError::UnsupportedUrl(format!("scheme '{other}'"))),
        }
    }
}

/// Database url safe for logs: any password is replaced.
pub fn redacted_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("***")).is_err() {
                return "<redacted>".into();
            }
            url.to_string()
        }
        Ok(_) => raw.trim().to_string(),
        Err(_) => "<unparseable>".into(),
    }
}

/// Opens the backend named by `config.url` and bootstraps its schema.
///
/// Blocks; the Postgres driver must not be constructed on an async worker.
pub fn connect(config: &StoreConfig) -> Result<SharedStore, StoreError> {
    let store: SharedStore = match Backend::from_url(&config.url)? {
        Backend::Postgres => Arc::new(PostgresStore::new(config)?),
        Backend::SqliteMemory => Arc::new(SqliteStore::open_in_memory()?),
        Backend::SqliteFile(path) => Arc::new(SqliteStore::open(&path, config.connect_timeout_ms)?),
    };
    Ok(store)
}
