use std::fmt;

use chrono::{DateTime, Datelike, Timelike};
use serde::{Deserialize, Serialize};

use super::RecordError;

/// Time bucket granularity. Buckets are decimal-encoded UTC timestamps:
/// minute `yyyyMMddHHmm`, hour `yyyyMMddHH`, day `yyyyMMdd`, month `yyyyMM`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Downsampling {
    Minute,
    Hour,
    Day,
    Month,
}

impl Downsampling {
    pub const ALL: [Downsampling; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn digits(self) -> u32 {
        match self {
            Self::Minute => 12,
            Self::Hour => 10,
            Self::Day => 8,
            Self::Month => 6,
        }
    }

    /// Bucket of a millisecond UTC timestamp at this granularity.
    pub fn bucket(self, timestamp_ms: i64) -> Result<i64, RecordError> {
        let at = DateTime::from_timestamp_millis(timestamp_ms)
            .filter(|at| (1000..=9999).contains(&at.year()))
            .ok_or(RecordError::InvalidTimestamp {
                timestamp: timestamp_ms,
            })?;

        let minute = i64::from(at.year()) * 100_000_000
            + i64::from(at.month()) * 1_000_000
            + i64::from(at.day()) * 10_000
            + i64::from(at.hour()) * 100
            + i64::from(at.minute());

        Ok(minute / 10_i64.pow(Self::Minute.digits() - self.digits()))
    }

    /// Granularity a bucket is encoded at, judged by its digit count.
    pub fn of_bucket(bucket: i64) -> Result<Self, RecordError> {
        let digits = if bucket > 0 { bucket.ilog10() + 1 } else { 0 };

        Self::ALL
            .into_iter()
            .find(|level| level.digits() == digits)
            .ok_or(RecordError::InvalidBucket {
                bucket,
                reason: "unexpected digit count",
            })
    }

    /// Re-derives `bucket` at this (equal or coarser) granularity.
    pub fn rollup(self, bucket: i64) -> Result<i64, RecordError> {
        let source = Self::of_bucket(bucket)?;
        if source > self {
            return Err(RecordError::InvalidBucket {
                bucket,
                reason: "cannot refine a coarser bucket",
            });
        }

        Ok(bucket / 10_i64.pow(source.digits() - self.digits()))
    }

    /// Storage model name of record `name` at this granularity.
    pub fn model_name(self, name: &str) -> String {
        format!("{name}_{}", self.suffix())
    }
}

impl fmt::Display for Downsampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}
