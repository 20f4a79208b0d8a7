use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, StringArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::assemble::{EntityLabel, MasterRecord};
use crate::error::PipelineError;

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub fn master_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("entity_id", DataType::UInt32, false),
        Field::new("entity", DataType::Utf8, false),
        Field::new("granularity", DataType::Utf8, false),
        Field::new("country", DataType::Utf8, false),
        Field::new("province", DataType::Utf8, true),
        Field::new("county", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, false),
        Field::new("longitude", DataType::Float64, false),
        Field::new("population", DataType::UInt64, true),
        Field::new("date", DataType::Date32, false),
        Field::new("date_text", DataType::Utf8, false),
        Field::new("forecast", DataType::Boolean, false),
        Field::new("confirmed", DataType::Float64, false),
        Field::new("deaths", DataType::Float64, false),
        Field::new("confirmed_upper", DataType::Float64, true),
        Field::new("confirmed_lower", DataType::Float64, true),
        Field::new("deaths_upper", DataType::Float64, true),
        Field::new("deaths_lower", DataType::Float64, true),
        Field::new("recovered", DataType::UInt64, true),
        Field::new("new_confirmed", DataType::Float64, false),
        Field::new("new_deaths", DataType::Float64, false),
        Field::new("per_capita_confirmed", DataType::Float64, true),
        Field::new("per_capita_deaths", DataType::Float64, true),
        Field::new("mortality_rate", DataType::Float64, true),
        Field::new("confirmed_size", DataType::Float64, false),
        Field::new("confirmed_color", DataType::Utf8, false),
        Field::new("confirmed_bucket", DataType::Utf8, false),
        Field::new("deaths_size", DataType::Float64, false),
        Field::new("deaths_color", DataType::Utf8, false),
        Field::new("deaths_bucket", DataType::Utf8, false),
        Field::new("text_confirmed", DataType::Utf8, false),
        Field::new("text_deaths", DataType::Utf8, false),
    ]))
}

pub fn entities_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("entity_id", DataType::UInt32, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("granularity", DataType::Utf8, false),
        Field::new("latitude", DataType::Float64, false),
        Field::new("longitude", DataType::Float64, false),
        Field::new("population", DataType::UInt64, true),
    ]))
}

fn strings<'a, T: 'a>(rows: &'a [T], pick: impl Fn(&'a T) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(pick).collect::<Vec<_>>()))
}

fn optional_strings<'a, T: 'a>(
    rows: &'a [T],
    pick: impl Fn(&'a T) -> Option<&'a str>,
) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(pick).collect::<Vec<_>>()))
}

fn floats<T>(rows: &[T], pick: impl Fn(&T) -> f64) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(pick).collect::<Vec<_>>()))
}

fn optional_floats<T>(rows: &[T], pick: impl Fn(&T) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(pick).collect::<Vec<_>>()))
}

fn optional_counts<T>(rows: &[T], pick: impl Fn(&T) -> Option<u64>) -> ArrayRef {
    Arc::new(UInt64Array::from(rows.iter().map(pick).collect::<Vec<_>>()))
}

fn ids<T>(rows: &[T], pick: impl Fn(&T) -> u32) -> ArrayRef {
    Arc::new(UInt32Array::from(rows.iter().map(pick).collect::<Vec<_>>()))
}

fn epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn master_batch(records: &[MasterRecord]) -> Result<RecordBatch, PipelineError> {
    let columns: Vec<ArrayRef> = vec![
        ids(records, |r| r.entity_id),
        strings(records, |r| r.entity.as_str()),
        strings(records, |r| r.granularity.as_str()),
        strings(records, |r| r.country.as_str()),
        optional_strings(records, |r| r.province.as_deref()),
        optional_strings(records, |r| r.county.as_deref()),
        floats(records, |r| r.latitude),
        floats(records, |r| r.longitude),
        optional_counts(records, |r| r.population),
        Arc::new(Date32Array::from(
            records.iter().map(|r| epoch_days(r.date)).collect::<Vec<_>>(),
        )),
        strings(records, |r| r.date_text.as_str()),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.forecast).collect::<Vec<_>>(),
        )),
        floats(records, |r| r.confirmed),
        floats(records, |r| r.deaths),
        optional_floats(records, |r| r.confirmed_upper),
        optional_floats(records, |r| r.confirmed_lower),
        optional_floats(records, |r| r.deaths_upper),
        optional_floats(records, |r| r.deaths_lower),
        optional_counts(records, |r| r.recovered),
        floats(records, |r| r.new_confirmed),
        floats(records, |r| r.new_deaths),
        optional_floats(records, |r| r.per_capita_confirmed),
        optional_floats(records, |r| r.per_capita_deaths),
        optional_floats(records, |r| r.mortality_rate),
        floats(records, |r| r.confirmed_size),
        strings(records, |r| r.confirmed_color.as_str()),
        strings(records, |r| r.confirmed_bucket.as_str()),
        floats(records, |r| r.deaths_size),
        strings(records, |r| r.deaths_color.as_str()),
        strings(records, |r| r.deaths_bucket.as_str()),
        strings(records, |r| r.text_confirmed.as_str()),
        strings(records, |r| r.text_deaths.as_str()),
    ];
    RecordBatch::try_new(master_schema(), columns)
        .map_err(|err| PipelineError::Encode(format!("master batch: {err}")))
}

pub fn entities_batch(labels: &[EntityLabel]) -> Result<RecordBatch, PipelineError> {
    let columns: Vec<ArrayRef> = vec![
        ids(labels, |l| l.entity_id),
        strings(labels, |l| l.name.as_str()),
        strings(labels, |l| l.granularity.as_str()),
        floats(labels, |l| l.latitude),
        floats(labels, |l| l.longitude),
        optional_counts(labels, |l| l.population),
    ];
    RecordBatch::try_new(entities_schema(), columns)
        .map_err(|err| PipelineError::Encode(format!("entities batch: {err}")))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(format!("covid-forecast {}", env!("CARGO_PKG_VERSION"))),
    };
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(writer_properties()))
        .map_err(|err| PipelineError::Encode(format!("parquet writer init failed: {err}")))?;
    writer
        .write(batch)
        .map_err(|err| PipelineError::Encode(format!("parquet write failed: {err}")))?;
    writer
        .close()
        .map_err(|err| PipelineError::Encode(format!("parquet close failed: {err}")))?;
    Ok(buffer)
}

pub fn encode_master(records: &[MasterRecord]) -> Result<Vec<u8>, PipelineError> {
    encode_batch(&master_batch(records)?)
}

pub fn encode_entities(labels: &[EntityLabel]) -> Result<Vec<u8>, PipelineError> {
    encode_batch(&entities_batch(labels)?)
}
