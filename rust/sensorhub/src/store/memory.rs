//! In-process backend for development mode and tests.
//!
//! Transactions stage a full copy of the committed tables and swap it back on
//! commit. Writers are serialised by an async mutex held for the lifetime of
//! the transaction, so a staged copy can never be overwritten by a concurrent
//! batch. Readers (`query_buckets`) only see committed tables.

use super::{
    CheckpointStore, DeviceRegistry, MetricStore, RecordStore, SensorStore, StoreTransaction,
};
use crate::{
    error::{Result, ServiceError},
    models::{BucketAverage, BucketQuery, Device, NewRawRecord, RawRecord},
    sensor::Metric,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use parking_lot::RwLock;
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Committed contents of a [`MemorySensorStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    pub raw: Vec<RawRecord>,
    pub devices: BTreeMap<Uuid, Device>,
    pub checkpoints: BTreeMap<String, DateTime<Utc>>,
    pub metrics: Vec<Metric>,
    next_record_id: i64,
}

impl MemoryTables {
    fn next_arrival(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        match self.raw.last() {
            Some(last) if now <= last.arrived_at => last.arrived_at + Duration::microseconds(1),
            _ => now,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemorySensorStore {
    committed: Arc<RwLock<MemoryTables>>,
    writer: Arc<Mutex<()>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemorySensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a copy of another store's committed tables.
    pub fn from_tables(tables: MemoryTables) -> Self {
        Self {
            committed: Arc::new(RwLock::new(tables)),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> MemoryTables {
        self.committed.read().clone()
    }

    /// Makes the next `commit` fail after staging, as if the process died
    /// before the write became durable.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SensorStore for MemorySensorStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let staged = self.committed.read().clone();
        Ok(Box::new(MemoryTransaction {
            staged,
            store: self.clone(),
            _writer: writer,
        }))
    }

    async fn query_buckets(&self, query: &BucketQuery) -> Result<Vec<BucketAverage>> {
        let tables = self.committed.read();
        let filter = query.device_name.as_deref();
        let range = query.range();

        let mut groups: BTreeMap<(String, Reverse<DateTime<Utc>>), (Vec<f64>, u64)> =
            BTreeMap::new();
        for metric in &tables.metrics {
            let measured_at = metric.header.measured_at;
            if metric.kind() != query.sensor_kind || !range.contains(measured_at) {
                continue;
            }
            // Inner join: metrics without a registered device are not reported.
            let Some(device) = tables.devices.get(&metric.header.sensor_id) else {
                continue;
            };
            if filter.is_some_and(|name| name != device.device_name) {
                continue;
            }

            let key = (
                device.device_name.clone(),
                Reverse(query.bucket.floor(measured_at)),
            );
            let values = metric.reading.values();
            let (sums, count) = groups
                .entry(key)
                .or_insert_with(|| (vec![0.0; values.len()], 0));
            for (sum, value) in sums.iter_mut().zip(values) {
                *sum += value;
            }
            *count += 1;
        }

        Ok(groups
            .into_iter()
            .map(|((device_name, Reverse(bucket_start)), (sums, count))| BucketAverage {
                device_name,
                bucket_start,
                values: sums.into_iter().map(|sum| sum / count as f64).collect(),
            })
            .collect())
    }
}

struct MemoryTransaction {
    staged: MemoryTables,
    store: MemorySensorStore,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl RecordStore for MemoryTransaction {
    async fn insert_raw(&mut self, record: NewRawRecord) -> Result<RawRecord> {
        record.validate()?;
        let arrived_at = self.staged.next_arrival();
        self.staged.next_record_id += 1;
        let stored = RawRecord::from_new(self.staged.next_record_id, arrived_at, record);
        self.staged.raw.push(stored.clone());
        Ok(stored)
    }

    async fn select_since(
        &mut self,
        watermark: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawRecord>> {
        // `raw` is append-only with strictly increasing arrival times.
        let start = self
            .staged
            .raw
            .partition_point(|record| record.arrived_at <= watermark);
        Ok(self.staged.raw[start..].iter().take(limit).cloned().collect())
    }
}

#[async_trait]
impl CheckpointStore for MemoryTransaction {
    async fn watermark(&mut self, component: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.staged.checkpoints.get(component).copied())
    }

    async fn set_watermark(&mut self, component: &str, watermark: DateTime<Utc>) -> Result<()> {
        self.staged
            .checkpoints
            .insert(component.to_string(), watermark);
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for MemoryTransaction {
    async fn device(&mut self, sensor_id: Uuid) -> Result<Option<Device>> {
        Ok(self.staged.devices.get(&sensor_id).cloned())
    }

    async fn upsert_device(&mut self, device: &Device) -> Result<()> {
        self.staged.devices.insert(device.sensor_id, device.clone());
        Ok(())
    }
}

#[async_trait]
impl MetricStore for MemoryTransaction {
    async fn insert_metric(&mut self, metric: &Metric) -> Result<()> {
        self.staged.metrics.push(metric.clone());
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        if self.store.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::Store(anyhow::anyhow!(
                "memory store commit aborted"
            )));
        }
        let MemoryTransaction { staged, store, .. } = *self;
        *store.committed.write() = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorKind;

    fn new_record(payload: &str) -> NewRawRecord {
        NewRawRecord {
            sensor_id: Uuid::new_v4(),
            sensor_kind: SensorKind::Light,
            device_name: "lab".into(),
            measured_at: Utc::now(),
            payload: payload.into(),
        }
    }

    #[tokio::test]
    async fn arrival_times_strictly_increase() {
        let store = MemorySensorStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut last = None;
        for _ in 0..50 {
            let stored = tx.insert_raw(new_record(r#"{"light": 1}"#)).await.unwrap();
            if let Some(previous) = last {
                assert!(stored.arrived_at > previous);
            }
            last = Some(stored.arrived_at);
        }
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().raw.len(), 50);
    }

    #[tokio::test]
    async fn oversized_device_name_is_rejected_like_the_column() {
        let store = MemorySensorStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut record = new_record("{}");
        record.device_name = "d".repeat(NewRawRecord::MAX_DEVICE_NAME_CHARS + 1);

        let err = tx.insert_raw(record).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)), "{err:?}");
        tx.commit().await.unwrap();
        assert!(store.snapshot().raw.is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemorySensorStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_raw(new_record("{}")).await.unwrap();
        }
        assert!(store.snapshot().raw.is_empty());

        // The writer lock was released by the drop.
        let tx = store.begin().await.unwrap();
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn injected_commit_failure_leaves_state_untouched() {
        let store = MemorySensorStore::new();
        store.fail_next_commit();
        let mut tx = store.begin().await.unwrap();
        tx.set_watermark("consumer", Utc::now()).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert!(store.snapshot().checkpoints.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.set_watermark("consumer", Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn select_since_honours_watermark_and_limit() {
        let store = MemorySensorStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut stored = Vec::new();
        for _ in 0..5 {
            stored.push(tx.insert_raw(new_record("{}")).await.unwrap());
        }

        let page = tx.select_since(stored[1].arrived_at, 2).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![stored[2].id, stored[3].id]);
        assert!(tx
            .select_since(stored[4].arrived_at, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
