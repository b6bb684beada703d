//! Pages and the records hanging off them.
//!
//! A page is cross-linked through a resource entry sharing its external key
//! and owns parameters through `owner_external_key`. Keeping those in step is
//! best effort: the page mutation is what the caller asked for.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::application::outcome::SoftOutcome;
use crate::application::repos::RepoError;
use crate::application::storage::AdminStorage;
use crate::cache::snapshot::{CacheError, RecordCache};
use crate::domain::entities::{
    PageRecord, ParameterRecord, Record, RecordMeta, ResourceRecord, UriRecord,
};
use crate::domain::error::DomainError;
use crate::domain::pages::{normalize_name, source_checksum, validate_source};
use crate::domain::types::{QueryOperator, SortSpec};

const SITE_RESOURCE_CREATE: &str = "pages::resource_create";
const SITE_RESOURCE_SYNC: &str = "pages::resource_sync";
const SITE_RESOURCE_DELETE: &str = "pages::resource_delete";
const SITE_PARAMETER_CLEANUP: &str = "pages::parameter_cleanup";

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone)]
pub struct NewPage {
    pub name: String,
    pub html_source: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PageUpdate {
    pub name: Option<String>,
    pub html_source: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageMutation {
    pub page: PageRecord,
    /// Outcome of keeping the resource entry and owned parameters in step.
    pub dependents: SoftOutcome,
}

#[derive(Clone)]
pub struct PageService {
    storage: AdminStorage,
    cache: Option<Arc<RecordCache<PageRecord>>>,
}

impl PageService {
    pub fn new(storage: AdminStorage) -> Self {
        Self {
            storage,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<RecordCache<PageRecord>>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[instrument(skip_all, fields(name = %page.name))]
    pub async fn create(&self, page: NewPage) -> Result<PageMutation, PageError> {
        let name = normalize_name(&page.name)?;
        validate_source(&page.html_source)?;

        let record = PageRecord {
            meta: RecordMeta::default(),
            name,
            checksum: source_checksum(&page.html_source),
            html_source: page.html_source,
            content_type: page.content_type,
        };
        let page = self.storage.add(record).await?;

        let dependents = match ResourceRecord::for_page(&page) {
            Some(resource) => SoftOutcome::from_result(
                SITE_RESOURCE_CREATE,
                self.storage.add_with_key(resource).await,
            ),
            None => SoftOutcome::failure(SITE_RESOURCE_CREATE, "stored page has no external key"),
        };
        info!(key = ?page.key(), external_key = ?page.external_key(), "Page created");
        Ok(PageMutation { page, dependents })
    }

    #[instrument(skip(self, update))]
    pub async fn update(&self, key: i64, update: PageUpdate) -> Result<PageMutation, PageError> {
        let name = update.name.as_deref().map(normalize_name).transpose()?;
        if let Some(source) = &update.html_source {
            validate_source(source)?;
        }

        let mut record: PageRecord = self.storage.get(key).await?;
        if let Some(name) = name {
            record.name = name;
        }
        if let Some(source) = update.html_source {
            record.html_source = source;
        }
        if update.content_type.is_some() {
            record.content_type = update.content_type;
        }
        record.checksum = source_checksum(&record.html_source);

        let page = self.storage.update(record).await?;
        let dependents = self.sync_resource(&page).await;
        Ok(PageMutation { page, dependents })
    }

    /// Delete a page, its owned parameters and its resource entry.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: i64) -> Result<PageMutation, PageError> {
        let page: PageRecord = self.storage.delete(key).await?;
        let Some(external_key) = page.external_key() else {
            return Ok(PageMutation {
                page,
                dependents: SoftOutcome::Ok,
            });
        };

        let parameters = self
            .storage
            .delete_where::<ParameterRecord>("owner_external_key", QueryOperator::Eq, external_key)
            .await;
        let parameters = SoftOutcome::from_result(SITE_PARAMETER_CLEANUP, parameters);

        let resource = match self
            .storage
            .delete_by_external_key::<ResourceRecord>(external_key)
            .await
        {
            Ok(_) | Err(RepoError::NotFound { .. }) => SoftOutcome::Ok,
            Err(err) => SoftOutcome::failure(SITE_RESOURCE_DELETE, err),
        };

        info!(key, external_key, "Page deleted");
        Ok(PageMutation {
            dependents: parameters.and(resource),
            page,
        })
    }

    pub async fn get(&self, key: i64) -> Result<PageRecord, PageError> {
        match &self.cache {
            Some(cache) => cache
                .get(key)
                .await?
                .ok_or_else(|| RepoError::not_found(PageRecord::KIND, key).into()),
            None => Ok(self.storage.get(key).await?),
        }
    }

    pub async fn get_by_external_key(&self, external_key: &str) -> Result<PageRecord, PageError> {
        match &self.cache {
            Some(cache) => cache
                .get_by_external_key(external_key)
                .await?
                .ok_or_else(|| RepoError::not_found(PageRecord::KIND, external_key).into()),
            None => Ok(self.storage.get_by_external_key(external_key).await?),
        }
    }

    /// Pages sorted by `sort`, or in primary key order.
    pub async fn list(&self, sort: Option<SortSpec>) -> Result<Vec<PageRecord>, PageError> {
        match (&self.cache, sort) {
            (Some(cache), None) => Ok(cache.read_all().await?.to_vec()),
            (_, sort) => Ok(self.storage.all_records(sort).await?),
        }
    }

    /// URIs pointing at `page`.
    pub async fn links(&self, page: &PageRecord) -> Result<Vec<UriRecord>, PageError> {
        let Some(external_key) = page.external_key() else {
            return Ok(Vec::new());
        };
        Ok(self
            .storage
            .query("resource_external_key", QueryOperator::Eq, external_key)
            .await?)
    }

    /// Parameters owned by `page`.
    pub async fn parameters(&self, page: &PageRecord) -> Result<Vec<ParameterRecord>, PageError> {
        let Some(external_key) = page.external_key() else {
            return Ok(Vec::new());
        };
        Ok(self
            .storage
            .query("owner_external_key", QueryOperator::Eq, external_key)
            .await?)
    }

    /// Rename the resource entry of `page`, creating it when missing.
    async fn sync_resource(&self, page: &PageRecord) -> SoftOutcome {
        let Some(external_key) = page.external_key() else {
            return SoftOutcome::failure(SITE_RESOURCE_SYNC, "stored page has no external key");
        };
        let existing = self
            .storage
            .get_by_external_key::<ResourceRecord>(external_key)
            .await;
        let result = match existing {
            Ok(resource) if resource.name == page.name => return SoftOutcome::Ok,
            Ok(mut resource) => {
                resource.name = page.name.clone();
                self.storage.update(resource).await.map(|_| ())
            }
            Err(RepoError::NotFound { .. }) => match ResourceRecord::for_page(page) {
                Some(resource) => self.storage.add_with_key(resource).await.map(|_| ()),
                None => Ok(()),
            },
            Err(err) => Err(err),
        };
        SoftOutcome::from_result(SITE_RESOURCE_SYNC, result)
    }
}
