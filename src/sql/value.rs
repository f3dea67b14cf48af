use std::fmt;

use crate::sql::error::{SqlError, SqlResult};

/// A parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "'{}'", s),
            SqlValue::Bytes(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Bytes(v.to_vec())
    }
}

/// One row of a query result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlRow {
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, column: usize) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    fn column(&self, column: usize) -> SqlResult<&SqlValue> {
        self.values.get(column).ok_or_else(|| {
            SqlError::non_transient(0, "07009", format!("column {} out of range ({} columns)", column, self.values.len()))
        })
    }

    pub fn get_i64(&self, column: usize) -> SqlResult<i64> {
        match self.column(column)? {
            SqlValue::Integer(v) => Ok(*v),
            SqlValue::Text(s) => s.trim().parse().map_err(|_| conversion_error(column, "integer")),
            _ => Err(conversion_error(column, "integer")),
        }
    }

    pub fn get_string(&self, column: usize) -> SqlResult<Option<String>> {
        match self.column(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Integer(v) => Ok(Some(v.to_string())),
            SqlValue::Bytes(_) => Err(conversion_error(column, "text")),
        }
    }

    pub fn get_bytes(&self, column: usize) -> SqlResult<Option<Vec<u8>>> {
        match self.column(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Bytes(b) => Ok(Some(b.clone())),
            SqlValue::Text(s) => Ok(Some(s.as_bytes().to_vec())),
            SqlValue::Integer(_) => Err(conversion_error(column, "bytes")),
        }
    }
}

fn conversion_error(column: usize, target: &str) -> SqlError {
    SqlError::non_transient(0, "22018", format!("column {} cannot be read as {}", column, target))
}
