use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, types::Json};
use time::OffsetDateTime;

use crate::application::repos::{
    Document, FIELD_EXTERNAL_KEY, FIELD_KEY, FIELD_LAST_MODIFIED, FieldFilter, RecordBackend,
    RepoError, RowDraft, StoredRow,
};
use crate::domain::types::{RecordKind, SortDirection, SortSpec};

use super::PostgresRecordBackend;
use super::util::{map_insert_error, map_sqlx_error};

const RETURNING: &str = " RETURNING key, external_key, body, last_modified";
const SELECT_ROWS: &str = "SELECT key, external_key, body, last_modified FROM records WHERE kind = ";
const LAST_MODIFIED_MILLIS: &str = "(EXTRACT(EPOCH FROM last_modified) * 1000)::bigint";
/// Sort rank of a JSON type: null, boolean, number, string, array, object.
const TYPE_RANK: &str = "WHEN 'null' THEN 0 WHEN 'boolean' THEN 1 WHEN 'number' THEN 2 \
                         WHEN 'string' THEN 3 WHEN 'array' THEN 4 ELSE 5 END";

#[derive(sqlx::FromRow)]
struct RecordRow {
    key: i64,
    external_key: String,
    body: Json<Document>,
    last_modified: OffsetDateTime,
}

impl From<RecordRow> for StoredRow {
    fn from(row: RecordRow) -> Self {
        Self {
            key: row.key,
            external_key: row.external_key,
            last_modified: row.last_modified,
            fields: row.body.0,
        }
    }
}

/// Body field lookup with missing fields read as JSON null.
fn push_body_field(qb: &mut QueryBuilder<'_, Postgres>, field: &str) {
    qb.push("COALESCE(body -> ");
    qb.push_bind(field.to_string());
    qb.push(", 'null'::jsonb)");
}

/// Push the SQL expression for `field`, comparing against a bound value.
///
/// Strings compare bytewise (`COLLATE "C"`) and ordering operators never
/// match across JSON types, the same as [`FieldFilter::matches`].
fn push_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &FieldFilter,
) -> Result<(), RepoError> {
    let operator = filter.operator.as_sql();
    match filter.field.as_str() {
        FIELD_KEY => {
            let operand = integer_operand(filter)?;
            qb.push(" AND key ").push(operator).push(" ");
            qb.push_bind(operand);
        }
        FIELD_LAST_MODIFIED => {
            let operand = integer_operand(filter)?;
            qb.push(" AND ")
                .push(LAST_MODIFIED_MILLIS)
                .push(" ")
                .push(operator)
                .push(" ");
            qb.push_bind(operand);
        }
        FIELD_EXTERNAL_KEY => {
            let Some(external_key) = filter.value.as_str() else {
                return Err(RepoError::validation("external_key compares against a string"));
            };
            qb.push(" AND external_key COLLATE \"C\" ")
                .push(operator)
                .push(" ");
            qb.push_bind(external_key.to_string());
        }
        field if !filter.operator.is_ordering() => {
            qb.push(" AND ");
            push_body_field(qb, field);
            qb.push(" ").push(operator).push(" ");
            qb.push_bind(Json(filter.value.clone()));
        }
        field => match filter.value.as_str() {
            Some(text) => {
                qb.push(" AND jsonb_typeof(body -> ");
                qb.push_bind(field.to_string());
                qb.push(") = 'string' AND (body ->> ");
                qb.push_bind(field.to_string());
                qb.push(") COLLATE \"C\" ").push(operator).push(" ");
                qb.push_bind(text.to_string());
            }
            None => {
                qb.push(" AND jsonb_typeof(");
                push_body_field(qb, field);
                qb.push(") = jsonb_typeof(");
                qb.push_bind(Json(filter.value.clone()));
                qb.push(") AND ");
                push_body_field(qb, field);
                qb.push(" ").push(operator).push(" ");
                qb.push_bind(Json(filter.value.clone()));
            }
        },
    }
    Ok(())
}

fn integer_operand(filter: &FieldFilter) -> Result<i64, RepoError> {
    filter.value.as_i64().ok_or_else(|| {
        RepoError::validation(format!("`{}` compares against an integer", filter.field))
    })
}

/// Order by `sort`, ties broken by primary key. Body fields order by JSON
/// type rank first, then strings bytewise and other types by jsonb value,
/// matching [`sort_rows`](crate::application::repos::sort_rows) for scalars.
fn push_order(qb: &mut QueryBuilder<'_, Postgres>, sort: Option<&SortSpec>) {
    qb.push(" ORDER BY ");
    if let Some(sort) = sort {
        let direction = match sort.direction {
            SortDirection::Ascending => " ASC, ",
            SortDirection::Descending => " DESC, ",
        };
        match sort.field.as_str() {
            FIELD_KEY => {
                qb.push("key");
            }
            FIELD_EXTERNAL_KEY => {
                qb.push("external_key COLLATE \"C\"");
            }
            FIELD_LAST_MODIFIED => {
                qb.push("last_modified");
            }
            field => {
                qb.push("CASE jsonb_typeof(");
                push_body_field(qb, field);
                qb.push(") ").push(TYPE_RANK).push(direction);
                qb.push("(CASE WHEN jsonb_typeof(body -> ");
                qb.push_bind(field.to_string());
                qb.push(") = 'string' THEN body ->> ");
                qb.push_bind(field.to_string());
                qb.push(" END) COLLATE \"C\"").push(direction);
                push_body_field(qb, field);
            }
        }
        qb.push(direction);
    }
    qb.push("key ASC");
}

#[async_trait]
impl RecordBackend for PostgresRecordBackend {
    async fn insert(&self, kind: RecordKind, draft: RowDraft) -> Result<StoredRow, RepoError> {
        sqlx::query_as::<_, RecordRow>(
            "INSERT INTO records (kind, external_key, body, last_modified) \
             VALUES ($1, $2, $3, $4) \
             RETURNING key, external_key, body, last_modified",
        )
        .bind(kind.as_str())
        .bind(&draft.external_key)
        .bind(Json(&draft.fields))
        .bind(draft.last_modified)
        .fetch_one(self.pool())
        .await
        .map(StoredRow::from)
        .map_err(|err| map_insert_error(kind, &draft.external_key, err))
    }

    async fn get(&self, kind: RecordKind, key: i64) -> Result<Option<StoredRow>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_ROWS);
        qb.push_bind(kind.as_str()).push(" AND key = ");
        qb.push_bind(key);
        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(StoredRow::from))
    }

    async fn get_by_external_key(
        &self,
        kind: RecordKind,
        external_key: &str,
    ) -> Result<Option<StoredRow>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_ROWS);
        qb.push_bind(kind.as_str()).push(" AND external_key = ");
        qb.push_bind(external_key.to_string());
        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(StoredRow::from))
    }

    async fn update(&self, kind: RecordKind, row: StoredRow) -> Result<StoredRow, RepoError> {
        let updated = sqlx::query_as::<_, RecordRow>(
            "UPDATE records SET body = $3, last_modified = $4 \
             WHERE kind = $1 AND key = $2 \
             RETURNING key, external_key, body, last_modified",
        )
        .bind(kind.as_str())
        .bind(row.key)
        .bind(Json(&row.fields))
        .bind(row.last_modified)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        updated
            .map(StoredRow::from)
            .ok_or_else(|| RepoError::not_found(kind, row.key))
    }

    async fn delete(&self, kind: RecordKind, key: i64) -> Result<Option<StoredRow>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM records WHERE kind = ");
        qb.push_bind(kind.as_str()).push(" AND key = ");
        qb.push_bind(key);
        qb.push(RETURNING);
        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(StoredRow::from))
    }

    async fn delete_by_external_key(
        &self,
        kind: RecordKind,
        external_key: &str,
    ) -> Result<Option<StoredRow>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM records WHERE kind = ");
        qb.push_bind(kind.as_str()).push(" AND external_key = ");
        qb.push_bind(external_key.to_string());
        qb.push(RETURNING);
        let row = qb
            .build_query_as::<RecordRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(StoredRow::from))
    }

    async fn delete_where(
        &self,
        kind: RecordKind,
        filter: &FieldFilter,
    ) -> Result<u64, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM records WHERE kind = ");
        qb.push_bind(kind.as_str());
        push_predicate(&mut qb, filter)?;
        let result = qb
            .build()
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &FieldFilter,
    ) -> Result<Vec<StoredRow>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_ROWS);
        qb.push_bind(kind.as_str());
        push_predicate(&mut qb, filter)?;
        push_order(&mut qb, None);
        let rows = qb
            .build_query_as::<RecordRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(StoredRow::from).collect())
    }

    async fn scan(
        &self,
        kind: RecordKind,
        sort: Option<&SortSpec>,
    ) -> Result<Vec<StoredRow>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_ROWS);
        qb.push_bind(kind.as_str());
        push_order(&mut qb, sort);
        let rows = qb
            .build_query_as::<RecordRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(StoredRow::from).collect())
    }
}
