//! Column-oriented tabular value edited by a session.
//!
//! A [`DataFrame`] is an ordered list of uniquely named, equally long
//! [`Column`]s. Every cell is nullable.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::Shape;

// ── DType ──
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int64,
    Float64,
    Utf8,
    Bool,
    Timestamp,
    Duration,
    Categorical,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Duration => "duration",
            Self::Categorical => "categorical",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "int64" => Ok(Self::Int64),
            "float64" => Ok(Self::Float64),
            "utf8" => Ok(Self::Utf8),
            "bool" => Ok(Self::Bool),
            "timestamp" => Ok(Self::Timestamp),
            "duration" => Ok(Self::Duration),
            "categorical" => Ok(Self::Categorical),
            other => Err(format!("unknown DType: {other}")),
        }
    }
}

// ── ColumnData ──

/// Typed cell storage of one column. `None` is a null cell.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Bool(Vec<Option<bool>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
    Duration(Vec<Option<TimeDelta>>),
    /// Each code indexes into `categories`.
    Categorical {
        categories: Vec<String>,
        codes: Vec<Option<u32>>,
    },
}

impl ColumnData {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
            Self::Bool(_) => DType::Bool,
            Self::Timestamp(_) => DType::Timestamp,
            Self::Duration(_) => DType::Duration,
            Self::Categorical { .. } => DType::Categorical,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int64(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Utf8(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Timestamp(v) => v.len(),
            Self::Duration(v) => v.len(),
            Self::Categorical { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_count(&self) -> usize {
        fn nulls<T>(values: &[Option<T>]) -> usize {
            values.iter().filter(|v| v.is_none()).count()
        }
        match self {
            Self::Int64(v) => nulls(v),
            Self::Float64(v) => nulls(v),
            Self::Utf8(v) => nulls(v),
            Self::Bool(v) => nulls(v),
            Self::Timestamp(v) => nulls(v),
            Self::Duration(v) => nulls(v),
            Self::Categorical { codes, .. } => nulls(codes),
        }
    }

    /// Copy of rows `[offset, offset + len)`, clamped to the column length.
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        fn take<T: Clone>(values: &[Option<T>], offset: usize, len: usize) -> Vec<Option<T>> {
            values.iter().skip(offset).take(len).cloned().collect()
        }
        match self {
            Self::Int64(v) => Self::Int64(take(v, offset, len)),
            Self::Float64(v) => Self::Float64(take(v, offset, len)),
            Self::Utf8(v) => Self::Utf8(take(v, offset, len)),
            Self::Bool(v) => Self::Bool(take(v, offset, len)),
            Self::Timestamp(v) => Self::Timestamp(take(v, offset, len)),
            Self::Duration(v) => Self::Duration(take(v, offset, len)),
            Self::Categorical { categories, codes } => Self::Categorical {
                categories: categories.clone(),
                codes: take(codes, offset, len),
            },
        }
    }

    /// Build a categorical column from labels, assigning codes in order of
    /// first appearance.
    pub fn categorical_from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        let mut categories: Vec<String> = Vec::new();
        let codes = labels
            .into_iter()
            .map(|label| {
                label.map(|label| {
                    let label = label.into();
                    match categories.iter().position(|c| *c == label) {
                        Some(idx) => idx as u32,
                        None => {
                            categories.push(label);
                            (categories.len() - 1) as u32
                        }
                    }
                })
            })
            .collect();
        Self::Categorical { categories, codes }
    }

    /// For a categorical column: every code indexes a category and the
    /// category labels are unique. Other columns always pass.
    pub fn check_codes(&self) -> std::result::Result<(), String> {
        if let Self::Categorical { categories, codes } = self {
            if let Some(bad) = codes
                .iter()
                .flatten()
                .find(|code| **code as usize >= categories.len())
            {
                return Err(format!(
                    "categorical code {bad} out of range for {} categories",
                    categories.len()
                ));
            }
            let unique: HashSet<&String> = categories.iter().collect();
            if unique.len() != categories.len() {
                return Err("categorical categories must be unique".into());
            }
        }
        Ok(())
    }
}

// Floats compare by bit pattern so NaN cells equal themselves.
impl PartialEq for ColumnData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|(x, y)| x.map(f64::to_bits) == y.map(f64::to_bits))
            }
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            (
                Self::Categorical {
                    categories: ca,
                    codes: xa,
                },
                Self::Categorical {
                    categories: cb,
                    codes: xb,
                },
            ) => ca == cb && xa == xb,
            _ => false,
        }
    }
}

// ── Column ──
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── DataFrame ──
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    columns: Vec<Column>,
}

impl DataFrame {
    /// Build a frame, rejecting duplicate names, ragged columns and
    /// out-of-range categorical codes.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
            column
                .data
                .check_codes()
                .map_err(|e| Error::Validation(format!("column {}: {e}", column.name)))?;
        }
        if let Some(first) = columns.first() {
            let rows = first.len();
            if let Some(ragged) = columns.iter().find(|c| c.len() != rows) {
                return Err(Error::Validation(format!(
                    "column {} has {} rows, expected {rows}",
                    ragged.name,
                    ragged.len()
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn height(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.height(), self.width())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Append `column`, or replace the column of the same name in place.
    pub fn with_column(&self, column: Column) -> Result<Self> {
        let mut columns = self.columns.clone();
        match columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => columns.push(column),
        }
        Self::new(columns)
    }

    pub fn drop_column(&self, name: &str) -> Result<Self> {
        if self.column(name).is_none() {
            return Err(Error::Validation(format!("no such column: {name}")));
        }
        let columns = self
            .columns
            .iter()
            .filter(|c| c.name != name)
            .cloned()
            .collect();
        Self::new(columns)
    }

    /// First `n` rows.
    pub fn head(&self, n: usize) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.slice(0, n)))
                .collect(),
        }
    }
}
