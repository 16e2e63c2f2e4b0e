use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::merge::{ColumnField, MergeOperation};
use super::RecordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Long,
    Int,
    Double,
    Text,
    Binary,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Long => "long",
            Self::Int => "int",
            Self::Double => "double",
            Self::Text => "text",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// A column value detached from its record, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ColumnValue {
    Long(i64),
    Int(i32),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl ColumnValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Long(_) => ColumnType::Long,
            Self::Int(_) => ColumnType::Int,
            Self::Double(_) => ColumnType::Double,
            Self::Text(_) => ColumnType::Text,
            Self::Binary(_) => ColumnType::Binary,
        }
    }
}

/// Named column values of one record, as exchanged with storage.
pub type Row = BTreeMap<String, ColumnValue>;

type MergeFn<R> = Box<dyn Fn(&mut R, &R, Ordering) + Send + Sync>;
type ReadFn<R> = Box<dyn Fn(&R) -> ColumnValue + Send + Sync>;
type WriteFn<R> = Box<dyn Fn(&mut R, &ColumnValue) -> bool + Send + Sync>;
type NormalizeFn<R> = Box<dyn Fn(&mut R) + Send + Sync>;
type FormulaFn<R> = Box<dyn Fn(&mut R) + Send + Sync>;

/// Descriptor of one record field: its name, type, merge operation and an
/// optional formula recomputing it from the rest of the record.
pub struct Column<R> {
    name: &'static str,
    column_type: ColumnType,
    operation: MergeOperation,
    merge: MergeFn<R>,
    read: ReadFn<R>,
    write: WriteFn<R>,
    normalize: NormalizeFn<R>,
    formula: Option<FormulaFn<R>>,
}

impl<R: 'static> Column<R> {
    /// A stored column merged with `operation`.
    pub fn new<V: ColumnField>(
        name: &'static str,
        get: fn(&R) -> &V,
        get_mut: fn(&mut R) -> &mut V,
        operation: MergeOperation,
    ) -> Self {
        Self {
            name,
            column_type: V::TYPE,
            operation,
            merge: Box::new(move |existing, incoming, recency| {
                V::merge(get_mut(existing), get(incoming), operation, recency)
            }),
            read: Box::new(move |record| get(record).to_value()),
            write: Box::new(move |record, value| match V::from_value(value) {
                Some(v) => {
                    *get_mut(record) = v;
                    true
                }
                None => false,
            }),
            normalize: Box::new(move |record| get_mut(record).normalize(operation)),
            formula: None,
        }
    }

    /// A stored column whose value is always `formula` of the other columns.
    pub fn derived<V: ColumnField>(
        name: &'static str,
        get: fn(&R) -> &V,
        get_mut: fn(&mut R) -> &mut V,
        formula: fn(&R) -> V,
    ) -> Self {
        let mut column = Self::new(name, get, get_mut, MergeOperation::NonMerge);
        column.formula = Some(Box::new(move |record| {
            let value = formula(record);
            *get_mut(record) = value;
        }));
        column
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn operation(&self) -> MergeOperation {
        self.operation
    }

    pub fn is_derived(&self) -> bool {
        self.formula.is_some()
    }

    pub fn merge(&self, existing: &mut R, incoming: &R, recency: Ordering) {
        (self.merge)(existing, incoming, recency);
    }

    pub fn normalize(&self, record: &mut R) {
        (self.normalize)(record);
    }

    pub fn apply_formula(&self, record: &mut R) {
        if let Some(formula) = &self.formula {
            formula(record);
        }
    }

    pub fn read(&self, record: &R) -> ColumnValue {
        (self.read)(record)
    }

    pub fn write(&self, record: &mut R, value: &ColumnValue, model: &'static str) -> Result<(), RecordError> {
        if (self.write)(record, value) {
            Ok(())
        } else {
            Err(RecordError::ColumnTypeMismatch {
                model,
                column: self.name,
                expected: self.column_type,
                actual: value.column_type(),
            })
        }
    }
}

impl<R> fmt::Debug for Column<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("type", &self.column_type)
            .field("operation", &self.operation)
            .field("derived", &self.formula.is_some())
            .finish()
    }
}
