use crate::config::AppConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::{
    AnsiTransactionManager, AsyncPgConnection, SimpleAsyncConnection, TransactionManager,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

/// Connection settings for the sensor database, split out of [`AppConfig`]
/// so tests can build a pool from a bare URL.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub database_url: String,
    pub max_pool_size: u32,
    pub root_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

impl PoolOptions {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_pool_size: 4,
            root_cert: None,
            client_cert: None,
            client_key: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let database_url = config
            .database_url
            .clone()
            .context("SENSORS_DATABASE_URL or DATABASE_URL must be set")?;
        Ok(Self {
            database_url,
            max_pool_size: config.max_pool_size,
            root_cert: config.pg_ssl_root_cert.clone(),
            client_cert: config.pg_ssl_cert.clone(),
            client_key: config.pg_ssl_key.clone(),
        })
    }
}

pub async fn connect_pool(options: &PoolOptions) -> Result<PgPool> {
    let manager = PgConnectionManager::new(
        &options.database_url,
        options.root_cert.as_deref(),
        options.client_cert.as_deref(),
        options.client_key.as_deref(),
    )?;
    let pool = Pool::builder()
        .max_size(options.max_pool_size)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

/// Creates the sensor tables and indexes when they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut conn = pool.get().await.map_err(|err| {
        error!(error = ?err, "failed to acquire connection for schema bootstrap");
        anyhow::anyhow!("failed to acquire connection for schema bootstrap: {err:?}")
    })?;
    conn.batch_execute(SCHEMA_SQL)
        .await
        .context("failed to apply sensor schema")?;
    info!("sensor schema ready");
    Ok(())
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConnectionManager {
    pub(crate) fn new(
        database_url: &str,
        root_cert: Option<&str>,
        client_cert: Option<&str>,
        client_key: Option<&str>,
    ) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid sensors database URL")?;
        let tls = match root_cert {
            Some(path) => PgTls::Rustls(build_tls_connector(path, client_cert, client_key)?),
            None => PgTls::None,
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        match &self.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection)
                    .await
                    .map_err(|err| anyhow::anyhow!(err))
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    // A connection handed back while a batch transaction is still open (or
    // after a failed rollback) must never be reused.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        std::thread::panicking()
            || <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::is_broken_transaction_manager(conn)
    }
}

fn build_tls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut reader = BufReader::new(File::open(root_cert).context("failed to open PGSSLROOTCERT")?);
    let mut root_store = RootCertStore::empty();
    for cert in certs(&mut reader) {
        let cert = cert.context("failed to parse PGSSLROOTCERT")?;
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let client_config = match (client_cert, client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_client_certs(cert)?, load_client_key(key)?)
            .with_context(|| format!("failed to build client TLS config for {root_cert}"))?,
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    };

    Ok(MakeRustlsConnect::new(client_config))
}

fn load_client_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLCERT file '{path}'"))?,
    );

    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse PGSSLCERT")?;
    if chain.is_empty() {
        anyhow::bail!("PGSSLCERT contained no certificates");
    }

    Ok(chain)
}

fn load_client_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );

    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparseable_url() {
        assert!(PgConnectionManager::new("not a url ::", None, None, None).is_err());
    }

    #[test]
    fn missing_root_cert_file_is_reported() {
        let err = PgConnectionManager::new(
            "postgres://localhost/sensors",
            Some("/nonexistent/root.pem"),
            None,
            None,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("PGSSLROOTCERT"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_database_fails_schema_bootstrap() {
        let manager =
            PgConnectionManager::new("postgres://sensors@127.0.0.1:1/sensors", None, None, None)
                .unwrap();
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_millis(200))
            .build_unchecked(manager);

        let err = ensure_schema(&pool).await.unwrap_err();
        assert!(err.to_string().contains("schema bootstrap"), "{err}");
    }

    #[test]
    fn schema_bootstrap_is_idempotent_sql() {
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS raw_sensor_records"));
        assert!(!SCHEMA_SQL.contains("CREATE TABLE raw"));
    }
}
