#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Number,
    Date,
    Boolean,
    Enumerated,
}

/// A single cell value. Enumerated columns store `Text` values; `Null`
/// marks a missing cell of any column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl CellValue {
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Null) || matches!(self, Self::Number(v) if v.is_nan())
    }

    /// Whether this value may legally live in a column of the given type.
    /// `Null` fits every column.
    #[must_use]
    pub fn fits(&self, column_type: ColumnType) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(_) => column_type == ColumnType::Boolean,
            Self::Number(_) => column_type == ColumnType::Number,
            Self::Text(_) => {
                column_type == ColumnType::Text || column_type == ColumnType::Enumerated
            }
            Self::Date(_) => column_type == ColumnType::Date,
        }
    }

    pub fn to_number(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Number(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            Self::Text(v) => Err(TypeError::NonNumericValue { value: v.clone() }),
            Self::Date(v) => Err(TypeError::NonNumericValue {
                value: v.to_string(),
            }),
        }
    }

    pub fn to_text(&self) -> Result<&str, TypeError> {
        match self {
            Self::Text(v) => Ok(v),
            Self::Null => Err(TypeError::ValueIsMissing),
            other => Err(TypeError::WrongKind {
                expected: "text",
                found: other.kind_name(),
            }),
        }
    }

    pub fn to_date(&self) -> Result<NaiveDate, TypeError> {
        match self {
            Self::Date(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            other => Err(TypeError::WrongKind {
                expected: "date",
                found: other.kind_name(),
            }),
        }
    }

    pub fn to_bool(&self) -> Result<bool, TypeError> {
        match self {
            Self::Bool(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            other => Err(TypeError::WrongKind {
                expected: "boolean",
                found: other.kind_name(),
            }),
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
        }
    }

    /// Canonical string key used for set-filter membership and grouping.
    /// Distinct values must map to distinct keys within a column.
    #[must_use]
    pub fn set_key(&self) -> String {
        match self {
            Self::Null => "<null>".to_owned(),
            Self::Bool(v) => v.to_string(),
            Self::Number(v) => {
                if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
                    format!("{}", *v as i64)
                } else {
                    v.to_string()
                }
            }
            Self::Text(v) => v.clone(),
            Self::Date(v) => v.format("%Y-%m-%d").to_string(),
        }
    }

    /// Deterministic ordering for sorting: missing values last, then by
    /// kind rank (bool, number, date, text), then within kind. `f64`
    /// comparison uses `total_cmp` so the order is total.
    #[must_use]
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self.is_missing(), other.is_missing()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }

        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (a, b) => a.kind_rank().cmp(&b.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Number(_) => 1,
            Self::Date(_) => 2,
            Self::Text(_) => 3,
            Self::Null => 4,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
        }
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("value is missing")]
    ValueIsMissing,
    #[error("value {value:?} is not numeric")]
    NonNumericValue { value: String },
    #[error("expected a {expected} value but found {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },
}

/// Stable row identity, owned by the caller. The engine only orders and
/// filters references by id; it never rewrites one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RowId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    id: RowId,
    cells: BTreeMap<String, CellValue>,
}

impl Row {
    #[must_use]
    pub fn new(id: impl Into<RowId>, cells: BTreeMap<String, CellValue>) -> Self {
        Self {
            id: id.into(),
            cells,
        }
    }

    /// Convenience constructor for (column, value) pairs.
    #[must_use]
    pub fn from_pairs(
        id: impl Into<RowId>,
        pairs: impl IntoIterator<Item = (&'static str, CellValue)>,
    ) -> Self {
        let cells = pairs
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect();
        Self::new(id, cells)
    }

    #[must_use]
    pub fn id(&self) -> RowId {
        self.id
    }

    #[must_use]
    pub fn cells(&self) -> &BTreeMap<String, CellValue> {
        &self.cells
    }

    #[must_use]
    pub fn cell(&self, key: &str) -> Option<&CellValue> {
        self.cells.get(key)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RowSetError {
    #[error("duplicate row id {id}")]
    DuplicateRowId { id: RowId },
}

/// The caller-supplied row collection plus a first-position lookup map
/// so the sort/group/window stages can resolve ids without scanning.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    rows: Vec<Row>,
    positions: HashMap<RowId, usize>,
}

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Result<Self, RowSetError> {
        let mut positions = HashMap::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            if positions.insert(row.id(), idx).is_some() {
                return Err(RowSetError::DuplicateRowId { id: row.id() });
            }
        }
        Ok(Self { rows, positions })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn get(&self, id: RowId) -> Option<&Row> {
        self.positions.get(&id).map(|idx| &self.rows[*idx])
    }

    #[must_use]
    pub fn cell(&self, id: RowId, column: &str) -> Option<&CellValue> {
        self.get(id).and_then(|row| row.cell(column))
    }
}

/// Immutable once registered; replacing a descriptor invalidates that
/// column's value index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub key: String,
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    #[must_use]
    pub fn new(key: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            key: key.into(),
            column_type,
        }
    }
}
