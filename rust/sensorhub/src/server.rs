use crate::{
    aggregate::{AggregateRequest, AggregateResponse},
    config::{AppConfig, StoreBackend},
    db::{self, PoolOptions},
    error::{Result, ServiceError},
    ingest::IngestWorker,
    models::{NewRawRecord, RawRecord},
    state::AppState,
    store::{MemorySensorStore, PgSensorStore, SensorStore},
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = build_store(&config).await?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn SensorStore>) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), store);
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/records", post(Self::ingest_record))
            .route("/api/aggregate", post(Self::aggregate))
            .with_state(self.state.clone())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.request_timeout,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Serves HTTP and runs the ingest worker until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, backend = self.state.store.backend(), "sensorhub listening");

        let worker = IngestWorker::new(Arc::clone(&self.state.processor));
        let worker_handle = tokio::spawn(worker.run(token.clone()));

        let shutdown = token.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        // The server can also stop on its own (listener error); take the
        // worker down with it.
        token.cancel();
        if let Err(err) = worker_handle.await {
            warn!(error = %err, "ingest worker task ended abnormally");
        }

        served?;
        Ok(())
    }

    async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
        Json(json!({
            "status": "ok",
            "backend": state.store.backend(),
            "processed": state.processor.processed_total(),
        }))
    }

    async fn ingest_record(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(record): Json<NewRawRecord>,
    ) -> Result<(StatusCode, Json<RawRecord>)> {
        enforce_api_key(&headers, &state.config)?;
        record.validate()?;

        let mut tx = state.store.begin().await?;
        let stored = match tx.insert_raw(record).await {
            Ok(stored) => stored,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "raw insert rollback failed");
                }
                return Err(err);
            }
        };
        tx.commit().await?;
        Ok((StatusCode::CREATED, Json(stored)))
    }

    async fn aggregate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<AggregateRequest>,
    ) -> Result<Json<AggregateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let response = state.aggregation.execute(request).await?;
        Ok(Json(response))
    }
}

pub async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SensorStore>> {
    match config.store {
        StoreBackend::Memory => {
            warn!("using in-memory store; data is lost on restart");
            Ok(Arc::new(MemorySensorStore::new()))
        }
        StoreBackend::Postgres => {
            let pool = db::connect_pool(&PoolOptions::from_config(config)?).await?;
            db::ensure_schema(&pool).await?;
            Ok(Arc::new(PgSensorStore::new(pool)))
        }
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
