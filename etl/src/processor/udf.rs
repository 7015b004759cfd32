use crate::storage::writer::DEFAULT_PARTITION;
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use common::{Error, Result};
use datafusion::arrow::array::{Int32Array, Int64Array, StringArray, TimestampMillisecondArray};
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::DataFusionError;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, ScalarUDF, Volatility, create_udf};
use std::sync::Arc;

pub const EPOCH_MILLIS_TO_TIMESTAMP: &str = "epoch_millis_to_timestamp";
pub const PARTITION_VALUE: &str = "partition_value";

/// Calendar components derived from a play's start time.
///
/// All components are read from the UTC wall clock of the instant, which is
/// the naive-datetime convention the output tables are defined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarField {
    Hour,
    Day,
    Week,
    Month,
    Year,
    Weekday,
}

impl CalendarField {
    pub const ALL: [CalendarField; 6] = [
        CalendarField::Hour,
        CalendarField::Day,
        CalendarField::Week,
        CalendarField::Month,
        CalendarField::Year,
        CalendarField::Weekday,
    ];

    /// Output column name.
    pub fn column(&self) -> &'static str {
        match self {
            CalendarField::Hour => "hour",
            CalendarField::Day => "day",
            CalendarField::Week => "week",
            CalendarField::Month => "month",
            CalendarField::Year => "year",
            CalendarField::Weekday => "weekday",
        }
    }

    pub fn udf_name(&self) -> String {
        format!("calendar_{}", self.column())
    }

    /// `Week` is the ISO-8601 week number; `Weekday` counts from Monday = 0.
    pub fn extract(&self, datetime: &NaiveDateTime) -> i32 {
        match self {
            CalendarField::Hour => datetime.hour() as i32,
            CalendarField::Day => datetime.day() as i32,
            CalendarField::Week => datetime.iso_week().week() as i32,
            CalendarField::Month => datetime.month() as i32,
            CalendarField::Year => datetime.year(),
            CalendarField::Weekday => datetime.weekday().num_days_from_monday() as i32,
        }
    }
}

/// Registers all UDFs with the SessionContext
pub fn register_udfs(ctx: &SessionContext) -> Result<()> {
    ctx.register_udf(epoch_millis_to_timestamp_udf());
    ctx.register_udf(partition_value_udf());
    for field in CalendarField::ALL {
        ctx.register_udf(calendar_udf(field));
    }
    Ok(())
}

pub fn epoch_millis_to_timestamp_udf() -> ScalarUDF {
    create_udf(
        EPOCH_MILLIS_TO_TIMESTAMP,
        vec![DataType::Int64],
        DataType::Timestamp(TimeUnit::Millisecond, None),
        Volatility::Immutable,
        Arc::new(|args: &[ColumnarValue]| {
            convert_to_timestamp(args).map_err(|e| DataFusionError::Execution(e.to_string()))
        }),
    )
}

pub fn calendar_udf(field: CalendarField) -> ScalarUDF {
    create_udf(
        &field.udf_name(),
        vec![DataType::Timestamp(TimeUnit::Millisecond, None)],
        DataType::Int32,
        Volatility::Immutable,
        Arc::new(move |args: &[ColumnarValue]| {
            extract_calendar_field(field, args)
                .map_err(|e| DataFusionError::Execution(e.to_string()))
        }),
    )
}

/// Inverse of the writer's directory naming for a partition column read back
/// from paths: the default partition becomes null, escapes are decoded.
pub fn partition_value_udf() -> ScalarUDF {
    create_udf(
        PARTITION_VALUE,
        vec![DataType::Utf8],
        DataType::Utf8,
        Volatility::Immutable,
        Arc::new(|args: &[ColumnarValue]| {
            decode_partition_values(args).map_err(|e| DataFusionError::Execution(e.to_string()))
        }),
    )
}

fn naive_utc(millis: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| {
            Error::InvalidTimestamp(format!("{} ms since epoch is out of range", millis))
        })
}

/// Converts Unix timestamp (milliseconds) to Arrow Timestamp
fn convert_to_timestamp(args: &[ColumnarValue]) -> Result<ColumnarValue> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let millis = arrays[0]
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| Error::SchemaMismatch("Expected int64 epoch milliseconds".to_string()))?;

    let values = millis
        .iter()
        .map(|opt_ms| {
            opt_ms
                .map(|ms| naive_utc(ms).map(|dt| dt.and_utc().timestamp_millis()))
                .transpose()
        })
        .collect::<Result<Vec<Option<i64>>>>()?;

    Ok(ColumnarValue::Array(Arc::new(TimestampMillisecondArray::from(values))))
}

fn decode_partition_values(args: &[ColumnarValue]) -> Result<ColumnarValue> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let raw = arrays[0]
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::SchemaMismatch("Expected utf8 partition values".to_string()))?;

    let values = raw
        .iter()
        .map(|opt| match opt {
            None => Ok(None),
            Some(DEFAULT_PARTITION) => Ok(None),
            Some(value) => urlencoding::decode(value)
                .map(|decoded| Some(decoded.into_owned()))
                .map_err(|_| {
                    Error::SchemaMismatch(format!("Partition value '{}' is not valid UTF-8", value))
                }),
        })
        .collect::<Result<Vec<Option<String>>>>()?;

    Ok(ColumnarValue::Array(Arc::new(StringArray::from(values))))
}

fn extract_calendar_field(field: CalendarField, args: &[ColumnarValue]) -> Result<ColumnarValue> {
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let timestamps = arrays[0]
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .ok_or_else(|| Error::SchemaMismatch("Expected millisecond timestamps".to_string()))?;

    let values = timestamps
        .iter()
        .map(|opt_ms| {
            opt_ms
                .map(|ms| naive_utc(ms).map(|dt| field.extract(&dt)))
                .transpose()
        })
        .collect::<Result<Vec<Option<i32>>>>()?;

    Ok(ColumnarValue::Array(Arc::new(Int32Array::from(values))))
}
