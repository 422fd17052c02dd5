use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use diesel_async::SimpleAsyncConnection;
use sensorhub::{
    config::{AppConfig, IngestConfig, StoreBackend},
    db::{self, PoolOptions},
    ingest::BatchProcessor,
    models::{NewRawRecord, RawRecord},
    sensor::SensorKind,
    server::Server,
    store::{MemorySensorStore, PgSensorStore, SensorStore},
    telemetry,
    time::parse_datetime,
};
use serde::Serialize;
use serde_json::Value;
use std::{env, future::Future, sync::Arc, time::Duration};
use tower::ServiceExt;
use uuid::Uuid;

pub const API_KEY: &str = "test-api-key";
pub const CHECKPOINT: &str = "consumer";

pub fn at(value: &str) -> DateTime<Utc> {
    parse_datetime(value).expect("test timestamp should parse")
}

pub fn ingest_config(batch_size: usize) -> IngestConfig {
    IngestConfig::new(CHECKPOINT, batch_size, Duration::from_millis(100))
        .expect("test ingest config should be valid")
}

pub fn processor(store: Arc<dyn SensorStore>, batch_size: usize) -> BatchProcessor {
    telemetry::init_test_tracing();
    BatchProcessor::new(store, ingest_config(batch_size))
}

/// A stable sensor identity per device name, so repeated seeds hit the same
/// registry row.
pub fn sensor_id(device_name: &str) -> Uuid {
    let mut bytes = [0u8; 16];
    for (slot, byte) in bytes.iter_mut().zip(device_name.bytes().cycle()) {
        *slot = byte;
    }
    Uuid::from_bytes(bytes)
}

pub fn reading(
    kind: SensorKind,
    device_name: &str,
    measured_at: &str,
    payload: &str,
) -> NewRawRecord {
    NewRawRecord {
        sensor_id: sensor_id(device_name),
        sensor_kind: kind,
        device_name: device_name.to_string(),
        measured_at: at(measured_at),
        payload: payload.to_string(),
    }
}

/// Appends raw records in order, each in its own committed transaction.
pub async fn seed(store: &dyn SensorStore, records: Vec<NewRawRecord>) -> Vec<RawRecord> {
    let mut stored = Vec::with_capacity(records.len());
    for record in records {
        let mut tx = store.begin().await.expect("begin should succeed");
        stored.push(tx.insert_raw(record).await.expect("insert should succeed"));
        tx.commit().await.expect("commit should succeed");
    }
    stored
}

/// Runs batches until the backlog is empty; returns the records processed.
pub async fn drain(processor: &BatchProcessor) -> usize {
    let mut total = 0;
    loop {
        let count = processor
            .process_batch()
            .await
            .expect("batch should commit");
        if count == 0 {
            return total;
        }
        total += count;
    }
}

pub fn memory_store() -> Arc<MemorySensorStore> {
    Arc::new(MemorySensorStore::new())
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
    }
}

pub fn test_config(api_key: Option<&str>) -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".parse().expect("loopback address"),
        store: StoreBackend::Memory,
        database_url: None,
        max_pool_size: 1,
        pg_ssl_root_cert: None,
        pg_ssl_cert: None,
        pg_ssl_key: None,
        api_key: api_key.map(str::to_string),
        request_timeout: Duration::from_secs(5),
        ingest: ingest_config(100),
    }
}

/// Router over a fresh in-memory store, driven through `oneshot`.
pub struct TestApp {
    pub server: Server,
    router: Router,
}

impl TestApp {
    pub fn new(api_key: Option<&str>) -> Self {
        telemetry::init_test_tracing();
        let server = Server::with_store(test_config(api_key), memory_store());
        let router = server.router();
        Self { server, router }
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle request")
    }

    pub async fn post_json<T>(
        &self,
        path: &str,
        payload: &T,
        include_api_key: bool,
    ) -> http::Response<Body>
    where
        T: Serialize,
    {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }

        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = builder
            .body(Body::from(body))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// Runs `test` against a freshly truncated Postgres store, or skips when
/// `SENSORS_TEST_DATABASE_URL` is not set.
pub async fn with_pg_store<F, Fut>(test: F)
where
    F: FnOnce(Arc<PgSensorStore>) -> Fut,
    Fut: Future<Output = ()>,
{
    telemetry::init_test_tracing();
    let Ok(url) = env::var("SENSORS_TEST_DATABASE_URL") else {
        eprintln!("[sensorhub-test] skipping: SENSORS_TEST_DATABASE_URL is not set");
        return;
    };

    let pool = db::connect_pool(&PoolOptions::new(url))
        .await
        .expect("failed to connect to test database");
    db::ensure_schema(&pool)
        .await
        .expect("failed to bootstrap test schema");
    {
        let mut conn = pool.get().await.expect("failed to acquire connection");
        conn.batch_execute(
            "TRUNCATE raw_sensor_records, sensor_devices, processing_state, metric_light, \
             metric_barometer, metric_location, metric_accelerometer RESTART IDENTITY",
        )
        .await
        .expect("failed to reset test tables");
    }

    test(Arc::new(PgSensorStore::new(pool))).await;
}
