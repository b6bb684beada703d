//! Backend boundary for record persistence.
//!
//! Backends operate on type-erased [`StoredRow`]s: storage metadata in
//! dedicated fields, the serialized record body as a JSON object.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{Record, RecordMeta};
use crate::domain::types::{QueryOperator, RecordKind, SortDirection, SortSpec};

/// Field names resolved from row metadata instead of the body.
pub const FIELD_KEY: &str = "key";
pub const FIELD_EXTERNAL_KEY: &str = "external_key";
pub const FIELD_LAST_MODIFIED: &str = "last_modified";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("{kind} record `{key}` not found")]
    NotFound { kind: RecordKind, key: String },
    #[error("{kind} record with external key `{external_key}` already exists")]
    Conflict {
        kind: RecordKind,
        external_key: String,
    },
    #[error("invalid input: {message}")]
    Validation { message: String },
    #[error("persistence error: {0}")]
    Io(String),
}

impl RepoError {
    pub fn not_found(kind: RecordKind, key: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn io(err: impl fmt::Display) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Document = Map<String, Value>;

/// A row ready for insertion: storage has assigned identity and timestamp,
/// the backend assigns the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct RowDraft {
    pub external_key: String,
    pub last_modified: OffsetDateTime,
    pub fields: Document,
}

/// A persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub key: i64,
    pub external_key: String,
    pub last_modified: OffsetDateTime,
    pub fields: Document,
}

/// Serialize a record body into a JSON object.
pub fn record_fields<R: Record>(record: &R) -> Result<Document, RepoError> {
    match serde_json::to_value(record).map_err(RepoError::io)? {
        Value::Object(fields) => Ok(fields),
        other => Err(RepoError::validation(format!(
            "{} record serialized to non-object `{other}`",
            R::KIND
        ))),
    }
}

impl RowDraft {
    pub fn into_row(self, key: i64) -> StoredRow {
        StoredRow {
            key,
            external_key: self.external_key,
            last_modified: self.last_modified,
            fields: self.fields,
        }
    }
}

impl StoredRow {
    /// Rebuild the typed record, restoring storage metadata.
    pub fn into_record<R: Record>(self) -> Result<R, RepoError> {
        let mut record: R = serde_json::from_value(Value::Object(self.fields)).map_err(|err| {
            RepoError::io(format!("corrupt {} row {}: {err}", R::KIND, self.key))
        })?;
        *record.meta_mut() = RecordMeta {
            key: Some(self.key),
            external_key: Some(self.external_key),
            last_modified: Some(self.last_modified),
        };
        Ok(record)
    }

    /// Resolve a named field, metadata first. Missing fields read as null.
    pub fn field(&self, name: &str) -> Value {
        match name {
            FIELD_KEY => Value::from(self.key),
            FIELD_EXTERNAL_KEY => Value::from(self.external_key.as_str()),
            FIELD_LAST_MODIFIED => Value::from(millis(self.last_modified)),
            _ => self.fields.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

pub fn millis(timestamp: OffsetDateTime) -> i64 {
    (timestamp.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Predicate over a single field, used by queries and bulk deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub operator: QueryOperator,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, operator: QueryOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, QueryOperator::Eq, value)
    }

    pub fn matches(&self, row: &StoredRow) -> bool {
        let actual = row.field(&self.field);
        match self.operator {
            QueryOperator::Eq => values_equal(&actual, &self.value),
            QueryOperator::NotEq => !values_equal(&actual, &self.value),
            QueryOperator::Lt => compare_values(&actual, &self.value) == Some(Ordering::Less),
            QueryOperator::Le => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            QueryOperator::Gt => compare_values(&actual, &self.value) == Some(Ordering::Greater),
            QueryOperator::Ge => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            compare_values(left, right) == Some(Ordering::Equal)
        }
        _ => left == right,
    }
}

/// Ordering between two values of the same JSON type; `None` across types.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: nulls first, then by JSON type, then value.
fn sort_order(left: &Value, right: &Value) -> Ordering {
    type_rank(left)
        .cmp(&type_rank(right))
        .then_with(|| {
            compare_values(left, right).unwrap_or_else(|| left.to_string().cmp(&right.to_string()))
        })
}

/// Sort rows by primary key, then stably by the requested field.
pub fn sort_rows(rows: &mut [StoredRow], sort: Option<&SortSpec>) {
    rows.sort_by_key(|row| row.key);
    if let Some(sort) = sort {
        rows.sort_by(|a, b| {
            let ordering = sort_order(&a.field(&sort.field), &b.field(&sort.field));
            match sort.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
    }
}

/// Persistence adapter for records of every kind.
///
/// Implementations provide per-row atomicity. A unique external key per kind
/// is enforced on insert.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn insert(&self, kind: RecordKind, draft: RowDraft) -> Result<StoredRow, RepoError>;

    async fn get(&self, kind: RecordKind, key: i64) -> Result<Option<StoredRow>, RepoError>;

    async fn get_by_external_key(
        &self,
        kind: RecordKind,
        external_key: &str,
    ) -> Result<Option<StoredRow>, RepoError>;

    /// Replace body and timestamp of an existing row. `NotFound` if absent.
    async fn update(&self, kind: RecordKind, row: StoredRow) -> Result<StoredRow, RepoError>;

    /// Remove a row, returning it when it existed.
    async fn delete(&self, kind: RecordKind, key: i64) -> Result<Option<StoredRow>, RepoError>;

    async fn delete_by_external_key(
        &self,
        kind: RecordKind,
        external_key: &str,
    ) -> Result<Option<StoredRow>, RepoError>;

    /// Remove every matching row, returning how many were removed.
    async fn delete_where(&self, kind: RecordKind, filter: &FieldFilter)
    -> Result<u64, RepoError>;

    /// Matching rows in primary key order.
    async fn query(
        &self,
        kind: RecordKind,
        filter: &FieldFilter,
    ) -> Result<Vec<StoredRow>, RepoError>;

    /// Every row of `kind`, by primary key or by the requested sort.
    async fn scan(
        &self,
        kind: RecordKind,
        sort: Option<&SortSpec>,
    ) -> Result<Vec<StoredRow>, RepoError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn row(key: i64, fields: Value) -> StoredRow {
        let Value::Object(fields) = fields else {
            panic!("fixture must be an object");
        };
        StoredRow {
            key,
            external_key: format!("ext-{key}"),
            last_modified: datetime!(2024-05-01 12:00:00.250 UTC),
            fields,
        }
    }

    #[test]
    fn metadata_fields_resolve_from_row() {
        let row = row(3, json!({"name": "a"}));
        assert_eq!(row.field("key"), json!(3));
        assert_eq!(row.field("external_key"), json!("ext-3"));
        assert_eq!(row.field("last_modified"), json!(1_714_564_800_250_i64));
        assert_eq!(row.field("missing"), Value::Null);
        assert_eq!(row.field("name"), json!("a"));
    }

    #[test]
    fn filters_compare_by_type() {
        let row = row(1, json!({"size": 10, "name": "b", "enabled": true}));
        assert!(FieldFilter::new("size", QueryOperator::Gt, 9).matches(&row));
        assert!(FieldFilter::new("size", QueryOperator::Le, 10.0).matches(&row));
        assert!(!FieldFilter::new("size", QueryOperator::Lt, 10).matches(&row));
        assert!(FieldFilter::eq("name", "b").matches(&row));
        assert!(FieldFilter::new("name", QueryOperator::NotEq, "c").matches(&row));
        assert!(!FieldFilter::new("name", QueryOperator::Gt, 1).matches(&row));
        assert!(FieldFilter::eq("enabled", true).matches(&row));
        assert!(FieldFilter::eq("absent", Value::Null).matches(&row));
    }

    #[test]
    fn sort_is_stable_with_nulls_first() {
        let mut rows = vec![
            row(4, json!({"name": "b"})),
            row(1, json!({"name": "b"})),
            row(2, json!({})),
            row(3, json!({"name": "a"})),
        ];

        sort_rows(&mut rows, Some(&SortSpec::ascending("name")));
        let keys: Vec<_> = rows.iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![2, 3, 1, 4]);

        sort_rows(&mut rows, Some(&SortSpec::descending("name")));
        let keys: Vec<_> = rows.iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![1, 4, 3, 2]);

        sort_rows(&mut rows, None);
        let keys: Vec<_> = rows.iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
    }

    #[test]
    fn sort_ranks_types_then_compares_bytes() {
        let mut rows = vec![
            row(1, json!({"v": "a"})),
            row(2, json!({"v": 3})),
            row(3, json!({"v": "B"})),
            row(4, json!({"v": true})),
            row(5, json!({})),
            row(6, json!({"v": 2.5})),
        ];
        sort_rows(&mut rows, Some(&SortSpec::ascending("v")));
        let keys: Vec<_> = rows.iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![5, 4, 6, 2, 3, 1]);
    }
}
