//! Sensor kinds and the typed readings decoded from raw payloads.
//!
//! [`SensorKind`] is the single dispatch point: it names the payload fields a
//! kind requires, the metric table it lands in and the columns the
//! aggregation engine averages. Adding a kind means adding one arm to each
//! table below and one [`Reading`] variant.

use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    Light,
    Barometer,
    Location,
    Accelerometer,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Light,
        SensorKind::Barometer,
        SensorKind::Location,
        SensorKind::Accelerometer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Light => "LIGHT",
            SensorKind::Barometer => "BAROMETER",
            SensorKind::Location => "LOCATION",
            SensorKind::Accelerometer => "ACCELEROMETER",
        }
    }

    /// JSON fields a payload of this kind must carry, in column order.
    pub fn payload_fields(self) -> &'static [&'static str] {
        match self {
            SensorKind::Light => &["light"],
            SensorKind::Barometer => &["air_pressure"],
            SensorKind::Location => &["latitude", "longitude"],
            SensorKind::Accelerometer => &["x", "y", "z"],
        }
    }

    pub fn metric_table(self) -> &'static str {
        match self {
            SensorKind::Light => "metric_light",
            SensorKind::Barometer => "metric_barometer",
            SensorKind::Location => "metric_location",
            SensorKind::Accelerometer => "metric_accelerometer",
        }
    }

    /// Metric columns averaged per bucket, parallel to [`Self::payload_fields`].
    pub fn value_columns(self) -> &'static [&'static str] {
        match self {
            SensorKind::Light => &["light_value"],
            SensorKind::Barometer => &["air_pressure"],
            SensorKind::Location => &["latitude", "longitude"],
            SensorKind::Accelerometer => &["val_x", "val_y", "val_z"],
        }
    }

    pub fn arity(self) -> usize {
        self.value_columns().len()
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim();
        SensorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| {
                ServiceError::InvalidRequest(format!("unknown sensor kind '{normalized}'"))
            })
    }
}

/// Fields every metric row carries regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricHeader {
    pub sensor_id: Uuid,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reading {
    Light { light: i32 },
    Barometer { air_pressure: f64 },
    Location { latitude: f64, longitude: f64 },
    Accelerometer { x: f64, y: f64, z: f64 },
}

impl Reading {
    pub fn kind(&self) -> SensorKind {
        match self {
            Reading::Light { .. } => SensorKind::Light,
            Reading::Barometer { .. } => SensorKind::Barometer,
            Reading::Location { .. } => SensorKind::Location,
            Reading::Accelerometer { .. } => SensorKind::Accelerometer,
        }
    }

    /// Values in [`SensorKind::value_columns`] order.
    pub fn values(&self) -> Vec<f64> {
        match *self {
            Reading::Light { light } => vec![f64::from(light)],
            Reading::Barometer { air_pressure } => vec![air_pressure],
            Reading::Location {
                latitude,
                longitude,
            } => vec![latitude, longitude],
            Reading::Accelerometer { x, y, z } => vec![x, y, z],
        }
    }

    /// Decodes a JSON payload for `kind`. Every field listed by
    /// [`SensorKind::payload_fields`] must be present and numeric, checked in
    /// table order; extra fields are ignored.
    pub fn decode(kind: SensorKind, payload: &str) -> Result<Self, PayloadError> {
        if payload.trim().is_empty() {
            return Err(PayloadError::Empty);
        }
        let value: Value =
            serde_json::from_str(payload).map_err(|err| PayloadError::Malformed(err.to_string()))?;
        let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

        let fields = kind.payload_fields();
        let values = fields
            .iter()
            .map(|&field| number_field(object, field))
            .collect::<Result<Vec<_>, _>>()?;

        match (kind, values.as_slice()) {
            (SensorKind::Light, &[light]) => Ok(Reading::Light {
                light: whole_i32("light", light)?,
            }),
            (SensorKind::Barometer, &[air_pressure]) => Ok(Reading::Barometer { air_pressure }),
            (SensorKind::Location, &[latitude, longitude]) => Ok(Reading::Location {
                latitude,
                longitude,
            }),
            (SensorKind::Accelerometer, &[x, y, z]) => Ok(Reading::Accelerometer { x, y, z }),
            _ => Err(PayloadError::Malformed(format!(
                "{kind} payload decoded {} values",
                values.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(flatten)]
    pub header: MetricHeader,
    pub reading: Reading,
}

impl Metric {
    pub fn kind(&self) -> SensorKind {
        self.reading.kind()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

fn number_field(object: &Map<String, Value>, field: &'static str) -> Result<f64, PayloadError> {
    let value = object
        .get(field)
        .filter(|value| !value.is_null())
        .ok_or(PayloadError::MissingField(field))?;
    value
        .as_f64()
        .filter(|number| number.is_finite())
        .ok_or(PayloadError::InvalidField {
            field,
            expected: "a finite number",
        })
}

/// Integral numbers in any JSON spelling (`512`, `512.0`, `5.12e2`) that fit
/// the `INTEGER` column.
fn whole_i32(field: &'static str, number: f64) -> Result<i32, PayloadError> {
    if number.fract() == 0.0 && number >= f64::from(i32::MIN) && number <= f64::from(i32::MAX) {
        Ok(number as i32)
    } else {
        Err(PayloadError::InvalidField {
            field,
            expected: "a whole number within the 32-bit range",
        })
    }
}
