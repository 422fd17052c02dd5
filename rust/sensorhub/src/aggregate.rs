//! Time-bucketed averages over the metric tables.

use crate::{
    error::{Result, ServiceError},
    models::{BucketAverage, BucketQuery},
    sensor::SensorKind,
    store::SensorStore,
    time::{self, BucketWidth, TimeRange},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Wire form of an aggregation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub sensor_kind: String,
    #[serde(deserialize_with = "time::flexible::deserialize")]
    pub start: DateTime<Utc>,
    #[serde(deserialize_with = "time::flexible::deserialize")]
    pub end: DateTime<Utc>,
    pub bucket: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub results: Vec<BucketAverage>,
}

#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn SensorStore>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self { store }
    }

    pub async fn execute(&self, request: AggregateRequest) -> Result<AggregateResponse> {
        let kind = request.sensor_kind.parse::<SensorKind>()?;
        let bucket = request.bucket.parse::<BucketWidth>()?;
        let range = TimeRange::new(request.start, request.end)?;
        let results = self
            .aggregate(kind, range, bucket, request.device_name.as_deref())
            .await?;
        Ok(AggregateResponse { results })
    }

    /// Averages every value column of `kind` per `(device_name, bucket)`.
    /// An empty or absent `device_name` matches every device. Results are
    /// ordered by device name (byte order) ascending, then bucket start
    /// descending; no matching rows yields an empty vec.
    pub async fn aggregate(
        &self,
        kind: SensorKind,
        range: TimeRange,
        bucket: BucketWidth,
        device_name: Option<&str>,
    ) -> Result<Vec<BucketAverage>> {
        let query = BucketQuery {
            sensor_kind: kind,
            start: range.start,
            end: range.end,
            bucket,
            device_name: device_name
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        };

        let mut rows = self.store.query_buckets(&query).await?;

        if let Some(row) = rows.iter().find(|row| row.values.len() != kind.arity()) {
            return Err(ServiceError::Store(anyhow::anyhow!(
                "{} backend returned {} values for {kind}, expected {}",
                self.store.backend(),
                row.values.len(),
                kind.arity()
            )));
        }

        rows.sort_by(|a, b| {
            a.device_name
                .as_bytes()
                .cmp(b.device_name.as_bytes())
                .then_with(|| b.bucket_start.cmp(&a.bucket_start))
        });

        debug!(
            %kind,
            %bucket,
            rows = rows.len(),
            backend = self.store.backend(),
            "aggregation complete"
        );
        Ok(rows)
    }
}
