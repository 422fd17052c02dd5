//! Checkpointed batch ingestion.
//!
//! [`BatchProcessor::process_batch`] moves raw records past the consumer's
//! watermark into typed metric tables. Every write of a batch (metrics,
//! device upserts and the watermark) happens inside one store transaction;
//! any failure rolls all of it back and leaves the watermark where it was,
//! so the same batch is selected again on the next call.

mod worker;

pub use worker::IngestWorker;

use crate::{
    config::IngestConfig,
    error::{Result, ServiceError},
    models::{Device, RawRecord},
    sensor::{Metric, MetricHeader, Reading},
    store::{SensorStore, StoreTransaction},
};
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

pub struct BatchProcessor {
    store: Arc<dyn SensorStore>,
    config: IngestConfig,
    processed: AtomicU64,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn SensorStore>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            processed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Records committed by this processor since it was created.
    pub fn processed_total(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Runs one batch and returns how many records it committed. Zero means
    /// nothing was waiting past the watermark.
    pub async fn process_batch(&self) -> Result<usize> {
        let mut tx = self.store.begin().await?;

        match self.apply(tx.as_mut()).await {
            Ok(outcome) => {
                tx.commit().await?;
                if let Some(watermark) = outcome.watermark {
                    self.processed
                        .fetch_add(outcome.records as u64, Ordering::Relaxed);
                    info!(
                        component = %self.config.checkpoint_name,
                        records = outcome.records,
                        watermark = %watermark,
                        "batch committed"
                    );
                }
                Ok(outcome.records)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        component = %self.config.checkpoint_name,
                        error = %rollback_err,
                        "batch rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn apply(&self, tx: &mut dyn StoreTransaction) -> Result<BatchOutcome> {
        let component = self.config.checkpoint_name.as_str();
        let watermark = tx
            .watermark(component)
            .await?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let records = tx.select_since(watermark, self.config.batch_size).await?;
        if records.is_empty() {
            debug!(component, %watermark, "no records past watermark");
            return Ok(BatchOutcome::default());
        }

        let mut next_watermark = watermark;
        for record in &records {
            let metric = classify(record)?;

            let device = match tx.device(record.sensor_id).await? {
                Some(mut device) => {
                    device.observe(record);
                    device
                }
                None => Device::first_sighting(record),
            };
            tx.upsert_device(&device).await?;
            tx.insert_metric(&metric).await?;

            next_watermark = next_watermark.max(record.arrived_at);
        }

        tx.set_watermark(component, next_watermark).await?;
        Ok(BatchOutcome {
            records: records.len(),
            watermark: Some(next_watermark),
        })
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    records: usize,
    watermark: Option<DateTime<Utc>>,
}

/// Decodes a raw record into the metric for its declared kind.
pub fn classify(record: &RawRecord) -> Result<Metric> {
    let reading = Reading::decode(record.sensor_kind, &record.payload).map_err(|err| {
        ServiceError::validation(
            record.id,
            format!("{} payload: {err}", record.sensor_kind),
        )
    })?;

    Ok(Metric {
        header: MetricHeader {
            sensor_id: record.sensor_id,
            measured_at: record.measured_at,
        },
        reading,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorKind;
    use uuid::Uuid;

    fn raw(kind: SensorKind, payload: &str) -> RawRecord {
        RawRecord {
            id: 7,
            sensor_id: Uuid::new_v4(),
            sensor_kind: kind,
            device_name: "roof".into(),
            measured_at: Utc::now(),
            arrived_at: Utc::now(),
            payload: payload.into(),
        }
    }

    #[test]
    fn classify_builds_metric_with_header() {
        let record = raw(SensorKind::Location, r#"{"latitude": 1.5, "longitude": -2.0}"#);
        let metric = classify(&record).unwrap();
        assert_eq!(metric.header.sensor_id, record.sensor_id);
        assert_eq!(metric.header.measured_at, record.measured_at);
        assert_eq!(metric.kind(), SensorKind::Location);
    }

    #[test]
    fn classify_names_record_and_field() {
        let err = classify(&raw(SensorKind::Barometer, r#"{"pressure": 1}"#)).unwrap_err();
        match err {
            ServiceError::Validation { record_id, reason } => {
                assert_eq!(record_id, 7);
                assert!(reason.contains("air_pressure"), "{reason}");
                assert!(reason.contains("BAROMETER"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
