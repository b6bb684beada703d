//! Uploaded files: blob lifecycle and metadata.
//!
//! Replacing a file's payload stores the new blob first, persists metadata
//! second and releases the old blob last. A failure before the metadata
//! commit leaves the previous record and blob untouched; a failure while
//! releasing the old blob only leaks storage.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument};
use url::Url;

use crate::application::blobs::{BlobError, BlobStore, BlobUpload};
use crate::application::outcome::SoftOutcome;
use crate::application::repos::RepoError;
use crate::application::storage::AdminStorage;
use crate::cache::snapshot::{CacheError, RecordCache};
use crate::domain::classify::classify;
use crate::domain::entities::{FileRecord, Record};
use crate::domain::error::DomainError;
use crate::domain::types::{ContentCategory, QueryOperator, SortSpec};
use crate::domain::uploads::{
    BlobRef, content_disposition, normalize_content_type, normalize_file_name,
};

const SITE_DISCARD_NEW_BLOB: &str = "files::discard_new_blob";
const SITE_RELEASE_OLD_BLOB: &str = "files::release_old_blob";
const SITE_DELETE_BLOB: &str = "files::delete_blob";
const METRIC_BLOB_LEAKED_TOTAL: &str = "folio_blob_leaked_total";

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("file {key} has no stored payload")]
    MissingBlob { key: i64 },
}

/// A new payload, optionally replacing the payload of file `key`.
pub struct FileUpload {
    pub key: Option<i64>,
    /// Display name; defaults to the uploaded filename for new files and to
    /// the current name for replacements.
    pub name: Option<String>,
    pub blob: BlobUpload,
}

#[derive(Debug, Clone, Default)]
pub struct FileDetails {
    pub name: Option<String>,
    pub adjusted_content_type: Option<String>,
}

/// Result of a mutation plus the outcome of its blob cleanup step.
#[derive(Debug, Clone)]
pub struct FileMutation {
    pub record: FileRecord,
    pub cleanup: SoftOutcome,
}

#[derive(Debug, Clone)]
pub struct FileDownload {
    pub record: FileRecord,
    pub data: Bytes,
    pub content_disposition: String,
}

#[derive(Clone)]
pub struct FileService {
    storage: AdminStorage,
    blobs: Arc<dyn BlobStore>,
    cache: Option<Arc<RecordCache<FileRecord>>>,
}

impl FileService {
    pub fn new(storage: AdminStorage, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            storage,
            blobs,
            cache: None,
        }
    }

    /// Serve reads from `cache` instead of scanning storage.
    pub fn with_cache(mut self, cache: Arc<RecordCache<FileRecord>>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[instrument(skip_all, fields(key = ?upload.key))]
    pub async fn upload(&self, upload: FileUpload) -> Result<FileMutation, FileError> {
        let name = upload
            .name
            .as_deref()
            .map(normalize_file_name)
            .transpose()?;
        let previous = match upload.key {
            Some(key) => Some(self.storage.get::<FileRecord>(key).await?),
            None => None,
        };

        let stored = self.blobs.store(upload.blob).await?;
        let classification = classify(&stored.content_type, &stored.filename);

        let old_blob = previous.as_ref().and_then(|record| record.blob_ref.clone());
        let (meta, current_name) = previous
            .map(|record| (record.meta, Some(record.name)))
            .unwrap_or_default();
        let record = FileRecord {
            meta,
            name: name
                .or(current_name)
                .unwrap_or_else(|| stored.filename.clone()),
            blob_ref: Some(stored.reference.clone()),
            content_type: stored.content_type.to_ascii_lowercase(),
            adjusted_content_type: classification.adjusted_content_type,
            category: classification.category,
            hash: stored.hash,
            file_name: stored.filename,
            size: stored.size,
        };

        let persisted = if record.key().is_some() {
            self.storage.update(record).await
        } else {
            self.storage.add(record).await
        };
        let record = match persisted {
            Ok(record) => record,
            Err(err) => {
                self.release(&stored.reference, SITE_DISCARD_NEW_BLOB).await;
                return Err(err.into());
            }
        };

        info!(
            key = ?record.key(),
            reference = %stored.reference,
            category = %record.category,
            replaced = old_blob.is_some(),
            "File payload stored"
        );

        let cleanup = match old_blob {
            Some(old) if old != stored.reference => {
                self.release(&old, SITE_RELEASE_OLD_BLOB).await
            }
            _ => SoftOutcome::Ok,
        };
        Ok(FileMutation { record, cleanup })
    }

    pub async fn get(&self, key: i64) -> Result<FileRecord, FileError> {
        match &self.cache {
            Some(cache) => cache
                .get(key)
                .await?
                .ok_or_else(|| RepoError::not_found(FileRecord::KIND, key).into()),
            None => Ok(self.storage.get(key).await?),
        }
    }

    /// Every file, or only those in `category`, in primary key order.
    pub async fn list(
        &self,
        category: Option<ContentCategory>,
    ) -> Result<Vec<FileRecord>, FileError> {
        if let Some(cache) = &self.cache {
            let records = cache.read_all().await?;
            return Ok(records
                .iter()
                .filter(|record| category.is_none_or(|category| record.category == category))
                .cloned()
                .collect());
        }
        let records = match category {
            Some(category) => {
                self.storage
                    .query("category", QueryOperator::Eq, category.as_str())
                    .await?
            }
            None => self.storage.all_records(None).await?,
        };
        Ok(records)
    }

    /// Like [`FileService::list`], ordered by `sort`. Always reads storage.
    pub async fn list_sorted(
        &self,
        sort: SortSpec,
        category: Option<ContentCategory>,
    ) -> Result<Vec<FileRecord>, FileError> {
        let records: Vec<FileRecord> = self.storage.all_records(Some(sort)).await?;
        Ok(records
            .into_iter()
            .filter(|record| category.is_none_or(|category| record.category == category))
            .collect())
    }

    /// Change display name or serving type; nothing else is touched.
    #[instrument(skip(self, details))]
    pub async fn update_details(
        &self,
        key: i64,
        details: FileDetails,
    ) -> Result<FileRecord, FileError> {
        let name = details
            .name
            .as_deref()
            .map(normalize_file_name)
            .transpose()?;
        let adjusted = details
            .adjusted_content_type
            .as_deref()
            .map(normalize_content_type)
            .transpose()?;

        let mut record: FileRecord = self.storage.get(key).await?;
        if let Some(name) = name {
            record.name = name;
        }
        if let Some(adjusted) = adjusted {
            record.adjusted_content_type = adjusted;
        }
        Ok(self.storage.update(record).await?)
    }

    /// Delete the record, then its blob.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: i64) -> Result<FileMutation, FileError> {
        let record: FileRecord = self.storage.delete(key).await?;
        let cleanup = match &record.blob_ref {
            Some(reference) => self.release(reference, SITE_DELETE_BLOB).await,
            None => SoftOutcome::Ok,
        };
        Ok(FileMutation { record, cleanup })
    }

    pub fn serve_url(&self, reference: &BlobRef, size_hint: Option<u32>) -> Result<Url, FileError> {
        Ok(self.blobs.url_for(reference, size_hint)?)
    }

    pub async fn download(&self, key: i64) -> Result<FileDownload, FileError> {
        let record = self.get(key).await?;
        let reference = record
            .blob_ref
            .as_ref()
            .ok_or(FileError::MissingBlob { key })?;
        let data = self.blobs.fetch(reference).await?;
        let content_disposition =
            content_disposition(&record.adjusted_content_type, &record.file_name);
        Ok(FileDownload {
            record,
            data,
            content_disposition,
        })
    }

    async fn release(&self, reference: &BlobRef, site: &'static str) -> SoftOutcome {
        let outcome = SoftOutcome::from_result(site, self.blobs.delete(reference).await);
        if outcome.is_soft_failure() {
            counter!(METRIC_BLOB_LEAKED_TOTAL, "site" => site).increment(1);
        }
        outcome
    }
}
