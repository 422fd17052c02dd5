//! Storage capabilities shared by the batch processor and the aggregation
//! engine.
//!
//! The four capabilities are separate traits so each reads like the table it
//! fronts, but a batch needs them inside one atomic scope. That scope is a
//! [`StoreTransaction`], opened by [`SensorStore::begin`] and consumed by
//! `commit` or `rollback`. Dropping a transaction without either discards its
//! writes.

mod memory;
mod postgres;

pub use memory::MemorySensorStore;
pub use postgres::PgSensorStore;

use crate::{
    error::Result,
    models::{BucketAverage, BucketQuery, Device, NewRawRecord, RawRecord},
    sensor::Metric,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Append-only log of raw readings.
#[async_trait]
pub trait RecordStore: Send {
    /// Stores `record`, assigning its id and a strictly increasing
    /// `arrived_at`.
    async fn insert_raw(&mut self, record: NewRawRecord) -> Result<RawRecord>;

    /// Up to `limit` records with `arrived_at > watermark`, oldest first.
    async fn select_since(&mut self, watermark: DateTime<Utc>, limit: usize)
        -> Result<Vec<RawRecord>>;
}

#[async_trait]
pub trait CheckpointStore: Send {
    async fn watermark(&mut self, component: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set_watermark(&mut self, component: &str, watermark: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait DeviceRegistry: Send {
    async fn device(&mut self, sensor_id: Uuid) -> Result<Option<Device>>;

    async fn upsert_device(&mut self, device: &Device) -> Result<()>;
}

#[async_trait]
pub trait MetricStore: Send {
    async fn insert_metric(&mut self, metric: &Metric) -> Result<()>;
}

/// One atomic unit of work spanning every store capability.
#[async_trait]
pub trait StoreTransaction: RecordStore + CheckpointStore + DeviceRegistry + MetricStore {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Handle to a backing store. Cheap to share behind an `Arc`.
#[async_trait]
pub trait SensorStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Bucketed averages, grouped by `(device_name, bucket_start)` and ordered
    /// by device name ascending, then bucket start descending. Runs outside
    /// any batch transaction.
    async fn query_buckets(&self, query: &BucketQuery) -> Result<Vec<BucketAverage>>;
}
