//! Diesel schema definitions for the sensor tables (see `sql/schema.sql`).

diesel::table! {
    use diesel::sql_types::*;

    raw_sensor_records (id) {
        id -> Int8,
        sensor_id -> Uuid,
        sensor_kind -> Text,
        device_name -> Text,
        measured_at -> Timestamptz,
        arrived_at -> Timestamptz,
        payload -> Text,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    sensor_devices (sensor_id) {
        sensor_id -> Uuid,
        device_name -> Text,
        sensor_kind -> Text,
        last_seen -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    processing_state (component_name) {
        component_name -> Text,
        watermark -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    metric_light (id) {
        id -> Int8,
        sensor_id -> Uuid,
        measured_at -> Timestamptz,
        light_value -> Int4,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    metric_barometer (id) {
        id -> Int8,
        sensor_id -> Uuid,
        measured_at -> Timestamptz,
        air_pressure -> Float8,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    metric_location (id) {
        id -> Int8,
        sensor_id -> Uuid,
        measured_at -> Timestamptz,
        latitude -> Float8,
        longitude -> Float8,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    metric_accelerometer (id) {
        id -> Int8,
        sensor_id -> Uuid,
        measured_at -> Timestamptz,
        val_x -> Float8,
        val_y -> Float8,
        val_z -> Float8,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    raw_sensor_records,
    sensor_devices,
    processing_state,
    metric_light,
    metric_barometer,
    metric_location,
    metric_accelerometer,
);
