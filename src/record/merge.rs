use std::cmp::Ordering;

use serde::Deserialize;

use super::column::{ColumnType, ColumnValue};
use super::Record;

/// How an incoming column value combines with the accumulated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOperation {
    /// Keep the existing value. Used for dimensions and derived columns.
    NonMerge,
    /// The incoming value overwrites.
    Coverage,
    Sum,
    Max,
    Min,
    /// Value of the record with the newest source timestamp. Equal
    /// timestamps keep the larger value so the outcome is order independent.
    Latest,
    /// Strings: sorted union of comma-separated tokens. Binary: concatenation
    /// (order dependent). Numbers: same as `Sum`.
    Append,
}

/// A typed record field the merge engine can operate on.
pub trait ColumnField: Clone + Default + PartialOrd + Send + Sync + 'static {
    const TYPE: ColumnType;

    /// Merges `incoming` into `existing`. `recency` compares the incoming
    /// record's source timestamp with the existing one's.
    fn merge(existing: &mut Self, incoming: &Self, op: MergeOperation, recency: Ordering);

    /// Brings a freshly inserted value into the canonical form `op` merges
    /// produce.
    fn normalize(&mut self, _op: MergeOperation) {}

    fn to_value(&self) -> ColumnValue;

    fn from_value(value: &ColumnValue) -> Option<Self>;
}

/// Shared handling of the operations whose meaning does not depend on type.
/// Returns false when `op` needs type-specific treatment.
fn merge_ordered<V: Clone + PartialOrd>(
    existing: &mut V,
    incoming: &V,
    op: MergeOperation,
    recency: Ordering,
) -> bool {
    match op {
        MergeOperation::NonMerge => {}
        MergeOperation::Coverage => existing.clone_from(incoming),
        MergeOperation::Max => {
            if incoming > existing {
                existing.clone_from(incoming);
            }
        }
        MergeOperation::Min => {
            if incoming < existing {
                existing.clone_from(incoming);
            }
        }
        MergeOperation::Latest => match recency {
            Ordering::Greater => existing.clone_from(incoming),
            Ordering::Equal if incoming > existing => existing.clone_from(incoming),
            _ => {}
        },
        MergeOperation::Sum | MergeOperation::Append => return false,
    }
    true
}

impl ColumnField for i64 {
    const TYPE: ColumnType = ColumnType::Long;

    fn merge(existing: &mut Self, incoming: &Self, op: MergeOperation, recency: Ordering) {
        if !merge_ordered(existing, incoming, op, recency) {
            *existing = existing.saturating_add(*incoming);
        }
    }

    fn to_value(&self) -> ColumnValue {
        ColumnValue::Long(*self)
    }

    fn from_value(value: &ColumnValue) -> Option<Self> {
        match value {
            ColumnValue::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl ColumnField for i32 {
    const TYPE: ColumnType = ColumnType::Int;

    fn merge(existing: &mut Self, incoming: &Self, op: MergeOperation, recency: Ordering) {
        if !merge_ordered(existing, incoming, op, recency) {
            *existing = existing.saturating_add(*incoming);
        }
    }

    fn to_value(&self) -> ColumnValue {
        ColumnValue::Int(*self)
    }

    fn from_value(value: &ColumnValue) -> Option<Self> {
        match value {
            ColumnValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl ColumnField for f64 {
    const TYPE: ColumnType = ColumnType::Double;

    fn merge(existing: &mut Self, incoming: &Self, op: MergeOperation, recency: Ordering) {
        if !merge_ordered(existing, incoming, op, recency) {
            *existing += *incoming;
        }
    }

    fn to_value(&self) -> ColumnValue {
        ColumnValue::Double(*self)
    }

    fn from_value(value: &ColumnValue) -> Option<Self> {
        match value {
            ColumnValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl ColumnField for String {
    const TYPE: ColumnType = ColumnType::Text;

    fn merge(existing: &mut Self, incoming: &Self, op: MergeOperation, recency: Ordering) {
        if !merge_ordered(existing, incoming, op, recency) {
            union_tokens(existing, incoming);
        }
    }

    fn normalize(&mut self, op: MergeOperation) {
        if op == MergeOperation::Append {
            union_tokens(self, "");
        }
    }

    fn to_value(&self) -> ColumnValue {
        ColumnValue::Text(self.clone())
    }

    fn from_value(value: &ColumnValue) -> Option<Self> {
        match value {
            ColumnValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl ColumnField for Vec<u8> {
    const TYPE: ColumnType = ColumnType::Binary;

    fn merge(existing: &mut Self, incoming: &Self, op: MergeOperation, recency: Ordering) {
        if !merge_ordered(existing, incoming, op, recency) {
            existing.extend_from_slice(incoming);
        }
    }

    fn to_value(&self) -> ColumnValue {
        ColumnValue::Binary(self.clone())
    }

    fn from_value(value: &ColumnValue) -> Option<Self> {
        match value {
            ColumnValue::Binary(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Sorted, de-duplicated union of the comma-separated tokens of both sides.
fn union_tokens(existing: &mut String, incoming: &str) {
    let mut tokens: Vec<&str> = existing
        .split(',')
        .chain(incoming.split(','))
        .filter(|t| !t.is_empty())
        .collect();
    tokens.sort_unstable();
    tokens.dedup();

    *existing = tokens.join(",");
}

/// Merges `incoming` into `existing` column by column, then recomputes every
/// derived column from the merged values.
pub fn merge_record<R: Record>(existing: &mut R, incoming: &R) {
    let recency = incoming.timestamp().cmp(&existing.timestamp());

    let columns = R::columns();
    for column in columns {
        column.merge(existing, incoming, recency);
    }
    for column in columns {
        column.apply_formula(existing);
    }
}

/// Prepares a record entering an accumulator: append columns are put in
/// canonical form, then every derived column is recomputed.
pub fn apply_formulas<R: Record>(record: &mut R) {
    let columns = R::columns();
    for column in columns {
        column.normalize(record);
    }
    for column in columns {
        column.apply_formula(record);
    }
}
