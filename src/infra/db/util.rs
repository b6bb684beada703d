use crate::application::repos::RepoError;
use crate::domain::types::RecordKind;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::Database(db)
            if db.message().contains("invalid input syntax")
                || db.message().contains("violates check constraint") =>
        {
            RepoError::validation(db.message())
        }
        other => RepoError::io(other),
    }
}

/// Like [`map_sqlx_error`], reporting unique violations as a key conflict.
pub fn map_insert_error(kind: RecordKind, external_key: &str, err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict {
            kind,
            external_key: external_key.to_string(),
        },
        other => map_sqlx_error(other),
    }
}
