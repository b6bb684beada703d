//! Typed record storage.
//!
//! [`AdminStorage`] owns identity and timestamps: it assigns external keys,
//! stamps `last_modified` on every mutation and publishes exactly one
//! notification per successful mutation. Delivery problems are soft and never
//! change the result of the mutation.

use std::sync::Arc;

use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tracing::{debug, instrument};

use crate::application::ids::IdGenerator;
use crate::application::outcome::SoftOutcome;
use crate::application::repos::{
    FieldFilter, RecordBackend, RepoError, RowDraft, StoredRow, record_fields,
};
use crate::cache::bus::{NotificationBus, StorageOperation};
use crate::domain::entities::Record;
use crate::domain::types::{QueryOperator, SortSpec};

#[derive(Clone)]
pub struct AdminStorage {
    backend: Arc<dyn RecordBackend>,
    ids: Arc<IdGenerator>,
    bus: Arc<NotificationBus>,
}

impl AdminStorage {
    pub fn new(
        backend: Arc<dyn RecordBackend>,
        ids: Arc<IdGenerator>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self { backend, ids, bus }
    }

    pub fn backend(&self) -> Arc<dyn RecordBackend> {
        Arc::clone(&self.backend)
    }

    pub fn unique_id(&self) -> String {
        self.ids.next_id()
    }

    /// Persist a new record, assigning an external key when none is set.
    #[instrument(skip_all, fields(kind = %R::KIND))]
    pub async fn add<R: Record>(&self, mut record: R) -> Result<R, RepoError> {
        if record.external_key().is_none() {
            record.meta_mut().external_key = Some(self.ids.next_id());
        }
        self.insert(record).await
    }

    /// Persist a new record whose external key the caller chose.
    #[instrument(skip_all, fields(kind = %R::KIND))]
    pub async fn add_with_key<R: Record>(&self, record: R) -> Result<R, RepoError> {
        if record.external_key().is_none_or(|key| key.trim().is_empty()) {
            return Err(RepoError::validation(format!(
                "{} record requires a preset external key",
                R::KIND
            )));
        }
        self.insert(record).await
    }

    pub async fn get<R: Record>(&self, key: i64) -> Result<R, RepoError> {
        self.backend
            .get(R::KIND, key)
            .await?
            .ok_or_else(|| RepoError::not_found(R::KIND, key))?
            .into_record()
    }

    pub async fn get_by_external_key<R: Record>(&self, external_key: &str) -> Result<R, RepoError> {
        self.backend
            .get_by_external_key(R::KIND, external_key)
            .await?
            .ok_or_else(|| RepoError::not_found(R::KIND, external_key))?
            .into_record()
    }

    /// Replace the stored body of an existing record.
    ///
    /// Primary and external keys come from the stored copy; whatever the
    /// caller set on them is ignored.
    #[instrument(skip_all, fields(kind = %R::KIND, key = ?record.key()))]
    pub async fn update<R: Record>(&self, record: R) -> Result<R, RepoError> {
        let Some(key) = record.key() else {
            return Err(RepoError::validation(format!(
                "{} record must have a key to be updated",
                R::KIND
            )));
        };
        let existing = self
            .backend
            .get(R::KIND, key)
            .await?
            .ok_or_else(|| RepoError::not_found(R::KIND, key))?;

        let row = StoredRow {
            key,
            external_key: existing.external_key,
            last_modified: next_timestamp(Some(existing.last_modified)),
            fields: record_fields(&record)?,
        };
        let stored: R = self.backend.update(R::KIND, row).await?.into_record()?;
        self.publish(StorageOperation::Updated, &stored).await;
        Ok(stored)
    }

    #[instrument(skip(self), fields(kind = %R::KIND))]
    pub async fn delete<R: Record>(&self, key: i64) -> Result<R, RepoError> {
        let removed: R = self
            .backend
            .delete(R::KIND, key)
            .await?
            .ok_or_else(|| RepoError::not_found(R::KIND, key))?
            .into_record()?;
        self.publish(StorageOperation::Deleted, &removed).await;
        Ok(removed)
    }

    #[instrument(skip(self), fields(kind = %R::KIND))]
    pub async fn delete_by_external_key<R: Record>(
        &self,
        external_key: &str,
    ) -> Result<R, RepoError> {
        let removed: R = self
            .backend
            .delete_by_external_key(R::KIND, external_key)
            .await?
            .ok_or_else(|| RepoError::not_found(R::KIND, external_key))?
            .into_record()?;
        self.publish(StorageOperation::Deleted, &removed).await;
        Ok(removed)
    }

    /// Bulk delete; returns how many records were removed.
    #[instrument(skip(self, value), fields(kind = %R::KIND))]
    pub async fn delete_where<R: Record>(
        &self,
        field: &str,
        operator: QueryOperator,
        value: impl Into<Value>,
    ) -> Result<u64, RepoError> {
        let filter = FieldFilter::new(field, operator, value);
        let removed = self.backend.delete_where(R::KIND, &filter).await?;
        if removed > 0 {
            let outcome = self
                .bus
                .notify(self.bus.bulk_event::<R>(StorageOperation::Deleted))
                .await;
            log_delivery(&outcome);
        } else {
            debug!(field, "Bulk delete matched nothing");
        }
        Ok(removed)
    }

    pub async fn query<R: Record>(
        &self,
        field: &str,
        operator: QueryOperator,
        value: impl Into<Value>,
    ) -> Result<Vec<R>, RepoError> {
        let filter = FieldFilter::new(field, operator, value);
        self.backend
            .query(R::KIND, &filter)
            .await?
            .into_iter()
            .map(StoredRow::into_record)
            .collect()
    }

    pub async fn all_records<R: Record>(&self, sort: Option<SortSpec>) -> Result<Vec<R>, RepoError> {
        self.backend
            .scan(R::KIND, sort.as_ref())
            .await?
            .into_iter()
            .map(StoredRow::into_record)
            .collect()
    }

    async fn insert<R: Record>(&self, record: R) -> Result<R, RepoError> {
        let external_key = record
            .external_key()
            .map(str::to_string)
            .ok_or_else(|| RepoError::validation("external key must be set before insert"))?;
        let draft = RowDraft {
            external_key,
            last_modified: next_timestamp(None),
            fields: record_fields(&record)?,
        };
        let stored: R = self.backend.insert(R::KIND, draft).await?.into_record()?;
        self.publish(StorageOperation::Created, &stored).await;
        Ok(stored)
    }

    async fn publish<R: Record>(&self, operation: StorageOperation, record: &R) -> SoftOutcome {
        let outcome = self.bus.notify(self.bus.event_for(operation, record)).await;
        log_delivery(&outcome);
        outcome
    }
}

fn log_delivery(outcome: &SoftOutcome) {
    if let SoftOutcome::SoftFailure { reason, .. } = outcome {
        debug!(reason = %reason, "Mutation committed despite notification failure");
    }
}

/// Millisecond-precision UTC timestamp strictly after `previous`.
pub fn next_timestamp(previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = truncate_to_millis(OffsetDateTime::now_utc());
    match previous {
        Some(previous) if now <= previous => truncate_to_millis(previous) + Duration::milliseconds(1),
        _ => now,
    }
}

fn truncate_to_millis(timestamp: OffsetDateTime) -> OffsetDateTime {
    timestamp
        .replace_nanosecond(u32::from(timestamp.millisecond()) * 1_000_000)
        .unwrap_or(timestamp)
}
