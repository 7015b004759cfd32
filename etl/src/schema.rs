use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use std::sync::Arc;

/// Hidden column carrying each source row's position in the input.
pub const ORDINAL_COLUMN: &str = "_ordinal";

// Catalog (song metadata) records
pub fn song_source_schema() -> Schema {
    Schema::new(vec![
        Field::new("num_songs", DataType::Int64, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("artist_latitude", DataType::Float64, true),
        Field::new("artist_longitude", DataType::Float64, true),
        Field::new("artist_location", DataType::Utf8, true),
        Field::new("artist_name", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("duration", DataType::Float64, true),
        Field::new("year", DataType::Int64, true),
    ])
}

// Listening log (event) records
pub fn log_source_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist", DataType::Utf8, true),
        Field::new("auth", DataType::Utf8, true),
        Field::new("firstName", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("itemInSession", DataType::Int64, true),
        Field::new("lastName", DataType::Utf8, true),
        Field::new("length", DataType::Float64, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("page", DataType::Utf8, true),
        Field::new("registration", DataType::Float64, true),
        Field::new("sessionId", DataType::Int64, true),
        Field::new("song", DataType::Utf8, true),
        Field::new("status", DataType::Int64, true),
        Field::new("ts", DataType::Int64, true),
        Field::new("userAgent", DataType::Utf8, true),
        Field::new("userId", DataType::Utf8, true),
    ])
}

/// Appends the ordinal column to a source schema.
pub fn with_ordinal(schema: &Schema) -> SchemaRef {
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(ORDINAL_COLUMN, DataType::UInt64, false));
    Arc::new(Schema::new(fields))
}

pub const SONG_COLUMNS: [&str; 5] = ["song_id", "title", "artist_id", "year", "duration"];

pub const ARTIST_COLUMNS: [&str; 5] = [
    "artist_id",
    "artist_name",
    "artist_location",
    "artist_latitude",
    "artist_longitude",
];

pub const USER_COLUMNS: [&str; 5] = ["userId", "firstName", "lastName", "gender", "level"];

pub const TIME_COLUMNS: [&str; 7] = ["start_time", "hour", "day", "week", "month", "year", "weekday"];

pub const SONGPLAY_COLUMNS: [&str; 10] = [
    "start_time",
    "userId",
    "level",
    "song_id",
    "artist_id",
    "sessionId",
    "location",
    "userAgent",
    "year",
    "month",
];

pub const SONGPLAY_ID_COLUMN: &str = "songplay_id";

/// Partition columns of the song dimension as they are read back from
/// directory names.
pub fn song_table_partition_cols() -> Vec<(String, DataType)> {
    vec![
        ("year".to_string(), DataType::Utf8),
        ("artist_id".to_string(), DataType::Utf8),
    ]
}

/// Schema of the song dimension as read back, used when it holds no rows.
pub fn song_table_read_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("duration", DataType::Float64, true),
        Field::new("year", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
    ]))
}

/// Schema of the artist dimension as read back, used when it holds no rows.
pub fn artist_table_read_schema() -> SchemaRef {
    let source = song_source_schema();
    let fields: Vec<Field> = ARTIST_COLUMNS
        .iter()
        .filter_map(|name| source.field_with_name(name).ok().cloned())
        .collect();
    Arc::new(Schema::new(fields))
}
