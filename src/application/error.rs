use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::{blobs::BlobError, files::FileError, pages::PageError, repos::RepoError},
    cache::CacheError,
    domain::error::DomainError,
    infra::error::InfraError,
};

/// The error chain of a failed operation, flattened for logging.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub kind: ErrorKind,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, kind: ErrorKind, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            kind,
            messages,
        }
    }

    pub fn from_message(source: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            messages: vec![message.into()],
        }
    }
}

/// Caller-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Domain(_) | AppError::Validation(_) => ErrorKind::Validation,
            AppError::Repo(err) => repo_kind(err),
            AppError::Blob(err) => blob_kind(err),
            AppError::Cache(CacheError::Refresh { source, .. }) => repo_kind(source),
            AppError::Infra(InfraError::Configuration(_)) => ErrorKind::Validation,
            AppError::Infra(_) | AppError::Unexpected(_) => ErrorKind::Io,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self.kind(), self)
    }
}

fn repo_kind(err: &RepoError) -> ErrorKind {
    match err {
        RepoError::NotFound { .. } => ErrorKind::NotFound,
        RepoError::Conflict { .. } => ErrorKind::Conflict,
        RepoError::Validation { .. } => ErrorKind::Validation,
        RepoError::Io(_) => ErrorKind::Io,
    }
}

fn blob_kind(err: &BlobError) -> ErrorKind {
    match err {
        BlobError::NotFound { .. } => ErrorKind::NotFound,
        BlobError::InvalidReference { .. }
        | BlobError::PayloadTooLarge { .. }
        | BlobError::EmptyPayload
        | BlobError::SizeOverflow => ErrorKind::Validation,
        BlobError::Io(_) | BlobError::PayloadStream { .. } => ErrorKind::Io,
    }
}

impl From<FileError> for AppError {
    fn from(error: FileError) -> Self {
        match error {
            FileError::Repo(err) => Self::Repo(err),
            FileError::Blob(err) => Self::Blob(err),
            FileError::Cache(err) => Self::Cache(err),
            FileError::Domain(err) => Self::Domain(err),
            FileError::MissingBlob { key } => Self::Blob(BlobError::InvalidReference {
                reference: format!("file {key} has no stored payload"),
            }),
        }
    }
}

impl From<PageError> for AppError {
    fn from(error: PageError) -> Self {
        match error {
            PageError::Repo(err) => Self::Repo(err),
            PageError::Cache(err) => Self::Cache(err),
            PageError::Domain(err) => Self::Domain(err),
        }
    }
}
