//! Notification bus for storage mutations.
//!
//! Listeners subscribe per concrete record type when the bus is built; the
//! finished bus is immutable and injected into storage. Delivery is
//! synchronous with the mutation, in registration order, and a failing or
//! panicking listener never affects the others or the mutation itself.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::outcome::SoftOutcome;
use crate::domain::entities::Record;
use crate::domain::types::RecordKind;

const SITE_NOTIFY: &str = "cache::bus::notify";
const METRIC_NOTIFICATION_SOFT_FAILURE_TOTAL: &str = "folio_notification_soft_failure_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    Created,
    Updated,
    Deleted,
}

impl StorageOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageOperation::Created => "created",
            StorageOperation::Updated => "updated",
            StorageOperation::Deleted => "deleted",
        }
    }
}

/// A committed mutation of a record of type `R`.
#[derive(Debug, Clone)]
pub struct StorageEvent<R> {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub operation: StorageOperation,
    pub kind: RecordKind,
    /// Unset for bulk deletes.
    pub key: Option<i64>,
    pub external_key: Option<String>,
    /// The record as stored after the mutation, or as it was before deletion.
    pub record: Option<R>,
    pub timestamp: OffsetDateTime,
}

/// Failure reported by a listener.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(String);

impl ListenerError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

#[async_trait]
pub trait RecordListener<R: Record>: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_event(&self, event: &StorageEvent<R>) -> Result<(), ListenerError>;
}

struct Channel<R: Record> {
    listeners: Vec<Arc<dyn RecordListener<R>>>,
}

type ErasedChannel = Box<dyn Any + Send + Sync>;

/// Collects subscriptions before the bus is frozen.
#[derive(Default)]
pub struct NotificationBusBuilder {
    channels: HashMap<TypeId, ErasedChannel>,
}

impl NotificationBusBuilder {
    pub fn subscribe<R: Record>(mut self, listener: Arc<dyn RecordListener<R>>) -> Self {
        let entry = self
            .channels
            .entry(TypeId::of::<R>())
            .or_insert_with(|| {
                Box::new(Channel::<R> {
                    listeners: Vec::new(),
                })
            });
        if let Some(channel) = entry.downcast_mut::<Channel<R>>() {
            channel.listeners.push(listener);
        }
        self
    }

    pub fn build(self) -> NotificationBus {
        NotificationBus {
            channels: self.channels,
            epoch_counter: AtomicU64::new(0),
        }
    }
}

pub struct NotificationBus {
    channels: HashMap<TypeId, ErasedChannel>,
    epoch_counter: AtomicU64,
}

impl NotificationBus {
    pub fn builder() -> NotificationBusBuilder {
        NotificationBusBuilder::default()
    }

    /// A bus without subscribers.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn listener_count<R: Record>(&self) -> usize {
        self.channel::<R>()
            .map_or(0, |channel| channel.listeners.len())
    }

    /// Build an event for a single stored record.
    pub fn event_for<R: Record>(&self, operation: StorageOperation, record: &R) -> StorageEvent<R> {
        StorageEvent {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            operation,
            kind: R::KIND,
            key: record.key(),
            external_key: record.external_key().map(str::to_string),
            record: Some(record.clone()),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Build an event for a bulk delete, which has no single subject.
    pub fn bulk_event<R: Record>(&self, operation: StorageOperation) -> StorageEvent<R> {
        StorageEvent {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            operation,
            kind: R::KIND,
            key: None,
            external_key: None,
            record: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Deliver `event` to every listener subscribed to `R`.
    pub async fn notify<R: Record>(&self, event: StorageEvent<R>) -> SoftOutcome {
        let Some(channel) = self.channel::<R>() else {
            debug!(
                event_id = %event.id,
                kind = %R::KIND,
                "No listeners for storage event"
            );
            return SoftOutcome::Ok;
        };

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            kind = %event.kind,
            operation = event.operation.as_str(),
            key = ?event.key,
            listeners = channel.listeners.len(),
            "Storage event published"
        );

        let mut outcome = SoftOutcome::Ok;
        for listener in &channel.listeners {
            let delivery = AssertUnwindSafe(listener.on_event(&event))
                .catch_unwind()
                .await;
            let reason = match delivery {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("listener panicked: {}", panic_message(payload.as_ref())),
            };
            counter!(METRIC_NOTIFICATION_SOFT_FAILURE_TOTAL, "kind" => R::KIND.as_str())
                .increment(1);
            outcome = outcome.and(SoftOutcome::failure(
                SITE_NOTIFY,
                format_args!(
                    "{} listener `{}` failed on event {}: {reason}",
                    R::KIND,
                    listener.name(),
                    event.id
                ),
            ));
        }
        outcome
    }

    fn channel<R: Record>(&self) -> Option<&Channel<R>> {
        self.channels
            .get(&TypeId::of::<R>())
            .and_then(|erased| erased.downcast_ref::<Channel<R>>())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
