//! Blob storage boundary.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;
use url::Url;

use crate::domain::uploads::BlobRef;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{reference}` not found")]
    NotFound { reference: BlobRef },
    #[error("invalid blob reference `{reference}`")]
    InvalidReference { reference: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("uploaded file exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("uploaded file stream failed")]
    PayloadStream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded file is empty")]
    EmptyPayload,
    #[error("uploaded file size exceeds supported range")]
    SizeOverflow,
}

impl BlobError {
    pub fn stream(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::PayloadStream {
            source: source.into(),
        }
    }
}

/// An upload on its way into the blob store.
pub struct BlobUpload {
    pub filename: String,
    /// Declared by the client; guessed from the filename when absent.
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, BlobError>>,
}

impl BlobUpload {
    pub fn from_bytes(
        filename: impl Into<String>,
        content_type: Option<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            filename: filename.into(),
            content_type,
            body: futures::stream::once(async move { Ok(data) }).boxed(),
        }
    }
}

/// What the blob store reports about a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub reference: BlobRef,
    pub content_type: String,
    /// SHA-256 of the payload, lowercase hex.
    pub hash: String,
    pub filename: String,
    pub size: i64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError>;

    async fn fetch(&self, reference: &BlobRef) -> Result<Bytes, BlobError>;

    /// Time-limited URL serving the blob, optionally resized to `size_hint`.
    fn url_for(&self, reference: &BlobRef, size_hint: Option<u32>) -> Result<Url, BlobError>;

    /// Remove a blob. `NotFound` when it does not exist.
    async fn delete(&self, reference: &BlobRef) -> Result<(), BlobError>;
}
