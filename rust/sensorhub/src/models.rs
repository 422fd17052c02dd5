//! Records exchanged with the stores, and their diesel row mappings.

use crate::{
    error::ServiceError,
    schema::{raw_sensor_records, sensor_devices},
    sensor::SensorKind,
    time::{BucketWidth, TimeRange},
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reading as written by a producer, before the store assigns `id` and
/// `arrived_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawRecord {
    pub sensor_id: Uuid,
    pub sensor_kind: SensorKind,
    pub device_name: String,
    pub measured_at: DateTime<Utc>,
    /// Opaque JSON text; only decoded when the batch processor classifies it.
    pub payload: String,
}

impl NewRawRecord {
    /// Width of the `device_name` columns, in characters.
    pub const MAX_DEVICE_NAME_CHARS: usize = 64;

    /// Checks the fields every backend stores verbatim.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.device_name.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "device_name must not be empty".into(),
            ));
        }
        if self.device_name.chars().count() > Self::MAX_DEVICE_NAME_CHARS {
            return Err(ServiceError::InvalidRequest(format!(
                "device_name must be at most {} characters",
                Self::MAX_DEVICE_NAME_CHARS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub sensor_id: Uuid,
    pub sensor_kind: SensorKind,
    pub device_name: String,
    pub measured_at: DateTime<Utc>,
    pub arrived_at: DateTime<Utc>,
    pub payload: String,
}

impl RawRecord {
    pub fn from_new(id: i64, arrived_at: DateTime<Utc>, record: NewRawRecord) -> Self {
        Self {
            id,
            sensor_id: record.sensor_id,
            sensor_kind: record.sensor_kind,
            device_name: record.device_name,
            measured_at: record.measured_at,
            arrived_at,
            payload: record.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub sensor_id: Uuid,
    pub device_name: String,
    pub sensor_kind: SensorKind,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn first_sighting(record: &RawRecord) -> Self {
        Self {
            sensor_id: record.sensor_id,
            device_name: record.device_name.clone(),
            sensor_kind: record.sensor_kind,
            last_seen: record.measured_at,
        }
    }

    /// Applies a later-arriving record. Name and kind follow the record
    /// unconditionally, even when its `measured_at` is older than the stored
    /// state; only `last_seen` is guarded against moving backwards.
    pub fn observe(&mut self, record: &RawRecord) {
        self.device_name = record.device_name.clone();
        self.sensor_kind = record.sensor_kind;
        if record.measured_at > self.last_seen {
            self.last_seen = record.measured_at;
        }
    }
}

/// A bucketed aggregation request as handed to a metric store.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketQuery {
    pub sensor_kind: SensorKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: BucketWidth,
    /// Exact device name match; `None` means every device of the kind.
    pub device_name: Option<String>,
}

impl BucketQuery {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// Per-bucket averages, one value per aggregated column of the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketAverage {
    pub device_name: String,
    pub bucket_start: DateTime<Utc>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Queryable, QueryableByName)]
#[diesel(table_name = raw_sensor_records)]
pub struct RawRecordRow {
    pub id: i64,
    pub sensor_id: Uuid,
    pub sensor_kind: String,
    pub device_name: String,
    pub measured_at: DateTime<Utc>,
    pub arrived_at: DateTime<Utc>,
    pub payload: String,
}

impl TryFrom<RawRecordRow> for RawRecord {
    type Error = ServiceError;

    fn try_from(row: RawRecordRow) -> Result<Self, Self::Error> {
        let sensor_kind = row.sensor_kind.parse::<SensorKind>().map_err(|_| {
            ServiceError::validation(row.id, format!("unknown sensor kind '{}'", row.sensor_kind))
        })?;

        Ok(Self {
            id: row.id,
            sensor_id: row.sensor_id,
            sensor_kind,
            device_name: row.device_name,
            measured_at: row.measured_at,
            arrived_at: row.arrived_at,
            payload: row.payload,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sensor_devices, primary_key(sensor_id))]
pub struct DeviceRow {
    pub sensor_id: Uuid,
    pub device_name: String,
    pub sensor_kind: String,
    pub last_seen: DateTime<Utc>,
}

impl From<&Device> for DeviceRow {
    fn from(device: &Device) -> Self {
        Self {
            sensor_id: device.sensor_id,
            device_name: device.device_name.clone(),
            sensor_kind: device.sensor_kind.as_str().to_string(),
            last_seen: device.last_seen,
        }
    }
}

impl TryFrom<DeviceRow> for Device {
    type Error = ServiceError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let sensor_kind = row.sensor_kind.parse::<SensorKind>().map_err(|_| {
            ServiceError::Store(anyhow::anyhow!(
                "device {} has unknown sensor kind '{}'",
                row.sensor_id,
                row.sensor_kind
            ))
        })?;

        Ok(Self {
            sensor_id: row.sensor_id,
            device_name: row.device_name,
            sensor_kind,
            last_seen: row.last_seen,
        })
    }
}
