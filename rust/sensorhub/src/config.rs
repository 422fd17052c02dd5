use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use crate::error::ServiceError;

/// Floor for the idle poll delay so an empty raw table cannot spin the loop.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub checkpoint_name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl IngestConfig {
    /// Validates the consumer parameters, clamping the poll interval.
    pub fn new(
        checkpoint_name: impl Into<String>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> crate::error::Result<Self> {
        let checkpoint_name = checkpoint_name.into().trim().to_string();
        if checkpoint_name.is_empty() {
            return Err(ServiceError::Config(
                "checkpoint name must not be empty".into(),
            ));
        }
        if batch_size == 0 {
            return Err(ServiceError::Config("batch size must be at least 1".into()));
        }

        Ok(Self {
            checkpoint_name,
            batch_size,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        })
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            checkpoint_name: default_checkpoint_name(),
            batch_size: default_batch_size(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    sensors_listen_addr: Option<String>,
    #[serde(default)]
    sensors_listen_host: Option<String>,
    #[serde(default)]
    sensors_listen_port: Option<u16>,
    #[serde(default)]
    sensors_store: Option<String>,
    #[serde(default)]
    sensors_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    sensors_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    sensors_api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    sensors_request_timeout_secs: u64,
    #[serde(default = "default_checkpoint_name")]
    sensors_checkpoint_name: String,
    #[serde(default = "default_batch_size")]
    sensors_batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    sensors_poll_interval_ms: u64,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_batch_size() -> usize {
    1000
}

const fn default_poll_interval_ms() -> u64 {
    100
}

fn default_checkpoint_name() -> String {
    "consumer".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse SENSORS_* environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.sensors_listen_addr,
            raw.sensors_listen_host,
            raw.sensors_listen_port,
        )?;

        let store = parse_backend(raw.sensors_store.as_deref())?;

        let database_url = raw
            .sensors_database_url
            .or(raw.database_url)
            .filter(|url| !url.trim().is_empty());
        if store == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!(ServiceError::Config(
                "SENSORS_DATABASE_URL or DATABASE_URL must be set".into()
            ));
        }

        if raw.pgsslcert.is_some() != raw.pgsslkey.is_some() {
            anyhow::bail!(ServiceError::Config(
                "PGSSLCERT and PGSSLKEY must both be set (or neither)".into()
            ));
        }

        let ingest = IngestConfig::new(
            raw.sensors_checkpoint_name,
            raw.sensors_batch_size,
            Duration::from_millis(raw.sensors_poll_interval_ms),
        )?;

        Ok(Self {
            listen_addr,
            store,
            database_url,
            max_pool_size: raw.sensors_max_pool_size.max(1),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            api_key: raw.sensors_api_key.filter(|key| !key.is_empty()),
            request_timeout: Duration::from_secs(raw.sensors_request_timeout_secs.max(1)),
            ingest,
        })
    }
}

fn parse_backend(raw: Option<&str>) -> Result<StoreBackend> {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("postgres") | Some("postgresql") => Ok(StoreBackend::Postgres),
        Some("memory") => Ok(StoreBackend::Memory),
        Some(other) => anyhow::bail!(ServiceError::Config(format!(
            "unsupported SENSORS_STORE '{other}'"
        ))),
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid SENSORS_LISTEN_ADDR value")?
            .next()
            .context("SENSORS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid sensors listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
