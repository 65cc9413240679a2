//! Statement arguments and results

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

/// Largest magnitude at which every integral f64 is exactly representable
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A value bound to, or read back from, a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SqlValue {
    Null,
    Number(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SqlValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Bytes this value contributes to a statement, for quota estimates
    pub fn byte_size(&self) -> u64 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Number(_) => 8,
            SqlValue::Text(s) => s.len() as u64,
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            // Integral numbers bind as integers so they compare equal to rowids
            SqlValue::Number(n) if n.fract() == 0.0 && n.abs() < MAX_EXACT_INTEGER => {
                ToSqlOutput::Owned(Value::Integer(*n as i64))
            }
            SqlValue::Number(n) => ToSqlOutput::Owned(Value::Real(*n)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Number(i as f64),
            ValueRef::Real(r) => SqlValue::Number(r),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Number(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Number(value as f64)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Number(value as f64)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Rows produced by one statement, plus its write effects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    rows_affected: u64,
    insert_id: Option<i64>,
}

impl SqlResultSet {
    pub(crate) fn new(
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        rows_affected: u64,
        insert_id: Option<i64>,
    ) -> Self {
        Self {
            columns,
            rows,
            rows_affected,
            insert_id,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row`
    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Row id of the inserted row, for INSERT statements that changed a row
    pub fn insert_id(&self) -> Option<i64> {
        self.insert_id
    }
}
