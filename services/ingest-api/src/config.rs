use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result, bail};

use crate::store::StoreConfig;

pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

fn read_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn read_env_optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read_env_optional(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw}: {e}")),
        None => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    pub max_body_bytes: usize,
}

impl Config {
    /// Reads the process environment. `DATABASE_URL` is mandatory.
    pub fn from_env() -> Result<Self> {
        let Some(database_url) = read_env_optional("DATABASE_URL") else {
            bail!("DATABASE_URL is not set");
        };

        let host = read_env("INGEST_API_HOST", "0.0.0.0");
        // platforms that inject PORT still work
        let port = match read_env_optional("INGEST_API_PORT") {
            Some(_) => read_env_parsed("INGEST_API_PORT", 8000u16)?,
            None => read_env_parsed("PORT", 8000u16)?,
        };

        let store = StoreConfig {
            url: database_url,
            pool_max_size: read_env_parsed("DATABASE_POOL_SIZE", 16u32)?,
            connect_timeout_ms: read_env_parsed("DATABASE_CONNECT_TIMEOUT_MS", 5_000u64)?,
            statement_timeout_ms: read_env_parsed("DATABASE_STATEMENT_TIMEOUT_MS", 30_000u64)?,
        };
        if store.pool_max_size == 0 {
            bail!("DATABASE_POOL_SIZE must be at least 1");
        }

        Ok(Self {
            host,
            port,
            store,
            max_body_bytes: read_env_parsed("INGEST_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}
