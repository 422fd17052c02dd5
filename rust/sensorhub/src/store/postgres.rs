//! PostgreSQL backend built on diesel-async.
//!
//! A [`PgTransaction`] owns a pooled connection for its whole lifetime and
//! drives diesel's transaction manager directly, so the batch processor can
//! interleave its own logic between statements. A connection released while
//! its transaction is still open is reported broken to the pool.

use super::{
    CheckpointStore, DeviceRegistry, MetricStore, RecordStore, SensorStore, StoreTransaction,
};
use crate::{
    db::{PgConnectionManager, PgPool},
    error::{Result, ServiceError},
    models::{BucketAverage, BucketQuery, Device, DeviceRow, NewRawRecord, RawRecord, RawRecordRow},
    schema::{
        metric_accelerometer, metric_barometer, metric_light, metric_location, processing_state,
        raw_sensor_records, sensor_devices,
    },
    sensor::{Metric, Reading},
};
use anyhow::Context;
use async_trait::async_trait;
use bb8::PooledConnection;
use chrono::{DateTime, Utc};
use diesel::{
    pg::Pg,
    prelude::*,
    sql_query,
    sql_types::{Array, Float8, Text, Timestamptz, Uuid as SqlUuid},
    upsert::excluded,
};
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use tracing::debug;
use uuid::Uuid;

/// Serialises raw inserts so arrival order matches commit order.
const RAW_INSERT_LOCK_KEY: i64 = 0x5345_4e53_4f52_5331;

const INSERT_RAW_SQL: &str = "\
INSERT INTO raw_sensor_records (sensor_id, sensor_kind, device_name, measured_at, arrived_at, payload) \
VALUES ($1, $2, $3, $4, \
GREATEST(clock_timestamp(), (SELECT max(arrived_at) + interval '1 microsecond' FROM raw_sensor_records)), \
$5) \
RETURNING id, sensor_id, sensor_kind, device_name, measured_at, arrived_at, payload";

#[derive(Clone)]
pub struct PgSensorStore {
    pool: PgPool,
}

impl PgSensorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<PooledConnection<'static, PgConnectionManager>> {
        self.pool
            .get_owned()
            .await
            .map_err(|err| ServiceError::Store(anyhow::anyhow!("database pool error: {err:?}")))
    }
}

#[async_trait]
impl SensorStore for PgSensorStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let mut conn = self.connection().await?;
        AnsiTransactionManager::begin_transaction(&mut *conn)
            .await
            .context("failed to open batch transaction")?;
        Ok(Box::new(PgTransaction { conn }))
    }

    async fn query_buckets(&self, query: &BucketQuery) -> Result<Vec<BucketAverage>> {
        let mut conn = self.connection().await?;
        let sql = bucket_sql(query);
        debug!(sql = %sql, "executing bucket aggregation");

        let mut statement = sql_query(sql)
            .into_boxed::<Pg>()
            .bind::<Timestamptz, _>(query.start)
            .bind::<Timestamptz, _>(query.end);
        if let Some(device_name) = &query.device_name {
            statement = statement.bind::<Text, _>(device_name.clone());
        }

        let rows: Vec<BucketRow> = statement
            .load(&mut *conn)
            .await
            .context("bucket aggregation query failed")?;

        Ok(rows
            .into_iter()
            .map(|row| BucketAverage {
                device_name: row.device_name,
                bucket_start: row.bucket_start,
                values: row.value_set,
            })
            .collect())
    }
}

/// Builds the grouped average query for one sensor kind. Table, column and
/// unit names come from static dispatch tables; user input is bound.
fn bucket_sql(query: &BucketQuery) -> String {
    let kind = query.sensor_kind;
    let averages = kind
        .value_columns()
        .iter()
        .map(|column| format!("AVG(m.{column})::double precision"))
        .collect::<Vec<_>>()
        .join(", ");
    let bucket = format!(
        "(date_trunc('{unit}', m.measured_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC')",
        unit = query.bucket.trunc_unit()
    );
    let device_filter = if query.device_name.is_some() {
        " AND d.device_name = $3"
    } else {
        ""
    };

    format!(
        "SELECT d.device_name AS device_name, {bucket} AS bucket_start, \
         ARRAY[{averages}] AS value_set \
         FROM {table} m \
         JOIN sensor_devices d ON d.sensor_id = m.sensor_id \
         WHERE m.measured_at >= $1 AND m.measured_at <= $2{device_filter} \
         GROUP BY d.device_name, bucket_start \
         ORDER BY d.device_name COLLATE \"C\" ASC, bucket_start DESC",
        table = kind.metric_table(),
    )
}

#[derive(Debug, QueryableByName)]
struct BucketRow {
    #[diesel(sql_type = Text)]
    device_name: String,
    #[diesel(sql_type = Timestamptz)]
    bucket_start: DateTime<Utc>,
    #[diesel(sql_type = Array<Float8>)]
    value_set: Vec<f64>,
}

struct PgTransaction {
    conn: PooledConnection<'static, PgConnectionManager>,
}

impl PgTransaction {
    fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut *self.conn
    }
}

#[async_trait]
impl RecordStore for PgTransaction {
    async fn insert_raw(&mut self, record: NewRawRecord) -> Result<RawRecord> {
        record.validate()?;
        sql_query("SELECT pg_advisory_xact_lock($1)")
            .bind::<diesel::sql_types::Int8, _>(RAW_INSERT_LOCK_KEY)
            .execute(self.conn())
            .await?;

        let row: RawRecordRow = sql_query(INSERT_RAW_SQL)
            .bind::<SqlUuid, _>(record.sensor_id)
            .bind::<Text, _>(record.sensor_kind.as_str())
            .bind::<Text, _>(record.device_name)
            .bind::<Timestamptz, _>(record.measured_at)
            .bind::<Text, _>(record.payload)
            .get_result(self.conn())
            .await?;
        row.try_into()
    }

    async fn select_since(
        &mut self,
        watermark: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawRecord>> {
        use raw_sensor_records::dsl;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RawRecordRow> = dsl::raw_sensor_records
            .filter(dsl::arrived_at.gt(watermark))
            .order((dsl::arrived_at.asc(), dsl::id.asc()))
            .limit(limit)
            .load(self.conn())
            .await?;
        rows.into_iter().map(RawRecord::try_from).collect()
    }
}

#[async_trait]
impl CheckpointStore for PgTransaction {
    async fn watermark(&mut self, component: &str) -> Result<Option<DateTime<Utc>>> {
        use processing_state::dsl;

        Ok(dsl::processing_state
            .find(component)
            .select(dsl::watermark)
            .first::<DateTime<Utc>>(self.conn())
            .await
            .optional()?)
    }

    async fn set_watermark(&mut self, component: &str, watermark: DateTime<Utc>) -> Result<()> {
        use processing_state::dsl;

        diesel::insert_into(dsl::processing_state)
            .values((dsl::component_name.eq(component), dsl::watermark.eq(watermark)))
            .on_conflict(dsl::component_name)
            .do_update()
            .set(dsl::watermark.eq(excluded(dsl::watermark)))
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for PgTransaction {
    async fn device(&mut self, sensor_id: Uuid) -> Result<Option<Device>> {
        let row = sensor_devices::table
            .find(sensor_id)
            .first::<DeviceRow>(self.conn())
            .await
            .optional()?;
        row.map(Device::try_from).transpose()
    }

    async fn upsert_device(&mut self, device: &Device) -> Result<()> {
        let row = DeviceRow::from(device);
        diesel::insert_into(sensor_devices::table)
            .values(&row)
            .on_conflict(sensor_devices::sensor_id)
            .do_update()
            .set(&row)
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetricStore for PgTransaction {
    async fn insert_metric(&mut self, metric: &Metric) -> Result<()> {
        let sensor_id = metric.header.sensor_id;
        let measured_at = metric.header.measured_at;
        let conn = self.conn();

        match metric.reading {
            Reading::Light { light } => {
                diesel::insert_into(metric_light::table)
                    .values((
                        metric_light::sensor_id.eq(sensor_id),
                        metric_light::measured_at.eq(measured_at),
                        metric_light::light_value.eq(light),
                    ))
                    .execute(conn)
                    .await?
            }
            Reading::Barometer { air_pressure } => {
                diesel::insert_into(metric_barometer::table)
                    .values((
                        metric_barometer::sensor_id.eq(sensor_id),
                        metric_barometer::measured_at.eq(measured_at),
                        metric_barometer::air_pressure.eq(air_pressure),
                    ))
                    .execute(conn)
                    .await?
            }
            Reading::Location {
                latitude,
                longitude,
            } => {
                diesel::insert_into(metric_location::table)
                    .values((
                        metric_location::sensor_id.eq(sensor_id),
                        metric_location::measured_at.eq(measured_at),
                        metric_location::latitude.eq(latitude),
                        metric_location::longitude.eq(longitude),
                    ))
                    .execute(conn)
                    .await?
            }
            Reading::Accelerometer { x, y, z } => {
                diesel::insert_into(metric_accelerometer::table)
                    .values((
                        metric_accelerometer::sensor_id.eq(sensor_id),
                        metric_accelerometer::measured_at.eq(measured_at),
                        metric_accelerometer::val_x.eq(x),
                        metric_accelerometer::val_y.eq(y),
                        metric_accelerometer::val_z.eq(z),
                    ))
                    .execute(conn)
                    .await?
            }
        };
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        AnsiTransactionManager::commit_transaction(tx.conn())
            .await
            .context("failed to commit batch transaction")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        AnsiTransactionManager::rollback_transaction(tx.conn())
            .await
            .context("failed to roll back batch transaction")?;
        Ok(())
    }
}
