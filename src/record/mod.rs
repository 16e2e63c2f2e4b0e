//! Metric records: typed rows keyed by time bucket and entity, with a
//! declarative column table that drives merging, derived columns and the
//! storage row codec.

pub mod column;
pub mod error;
pub mod merge;
pub mod time_bucket;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::worker::StreamData;

pub use column::{Column, ColumnType, ColumnValue, Row};
pub use error::RecordError;
pub use merge::{apply_formulas, merge_record, ColumnField, MergeOperation};
pub use time_bucket::Downsampling;

/// Aggregation key: one entity within one time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub time_bucket: i64,
    pub entity: String,
}

impl CompositeKey {
    pub fn new(time_bucket: i64, entity: impl Into<String>) -> Self {
        Self {
            time_bucket,
            entity: entity.into(),
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.time_bucket, self.entity)
    }
}

/// A metric record type.
pub trait Record: StreamData + Default + fmt::Debug {
    /// Base storage model name; granularity suffixes are appended to it.
    const NAME: &'static str;

    /// Column table, built once per type.
    fn columns() -> &'static [Column<Self>];

    fn time_bucket(&self) -> i64;

    fn set_time_bucket(&mut self, bucket: i64);

    /// Dimension part of the key (service, service pair, instance...).
    fn entity_id(&self) -> String;

    /// Source timestamp in milliseconds, ordering `Latest` columns.
    fn timestamp(&self) -> i64;

    fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(self.time_bucket(), self.entity_id())
    }
}

/// Storage model name of `record`, derived from its bucket's granularity.
pub fn model_name<R: Record>(record: &R) -> Result<String, RecordError> {
    Ok(Downsampling::of_bucket(record.time_bucket())?.model_name(R::NAME))
}

pub fn to_row<R: Record>(record: &R) -> Row {
    R::columns()
        .iter()
        .map(|column| (column.name().to_string(), column.read(record)))
        .collect()
}

/// Rebuilds a record from a stored row. Every column must be present with
/// its declared type.
pub fn from_row<R: Record>(row: &Row) -> Result<R, RecordError> {
    let mut record = R::default();
    for column in R::columns() {
        let value = row.get(column.name()).ok_or(RecordError::MissingColumn {
            model: R::NAME,
            column: column.name(),
        })?;
        column.write(&mut record, value, R::NAME)?;
    }
    Ok(record)
}
