//! Per-type read-through snapshot cache.
//!
//! A cache holds at most one immutable [`Snapshot`] of every record of its
//! type. Notifications trigger full rebuilds; concurrent triggers are
//! coalesced so at most one scan per type runs at a time, and a trigger is
//! only ever answered by a scan that started after it was issued. A failed
//! rebuild leaves the previous snapshot in place.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::repos::{RecordBackend, RepoError, StoredRow};
use crate::domain::entities::Record;
use crate::domain::types::RecordKind;

use super::bus::{ListenerError, RecordListener, StorageEvent};
use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::snapshot";
const METRIC_CACHE_REFRESH_MS: &str = "folio_cache_refresh_ms";
const METRIC_CACHE_REFRESH_COALESCED_TOTAL: &str = "folio_cache_refresh_coalesced_total";
const METRIC_CACHE_REFRESH_FAILED_TOTAL: &str = "folio_cache_refresh_failed_total";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("failed to refresh {kind} cache")]
    Refresh {
        kind: RecordKind,
        #[source]
        source: RepoError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing loaded yet, or the first load failed.
    Empty,
    /// A scan is running; readers get the previous snapshot, if any.
    Loading,
    Ready,
}

/// Immutable point-in-time copy of every record of one type.
#[derive(Debug)]
pub struct Snapshot<R> {
    records: Arc<[R]>,
    by_key: HashMap<i64, usize>,
    by_external_key: HashMap<String, usize>,
    generation: u64,
    loaded_at: OffsetDateTime,
}

impl<R: Record> Snapshot<R> {
    fn build(records: Vec<R>, generation: u64) -> Self {
        let mut by_key = HashMap::with_capacity(records.len());
        let mut by_external_key = HashMap::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            if let Some(key) = record.key() {
                by_key.insert(key, index);
            }
            if let Some(external_key) = record.external_key() {
                by_external_key.insert(external_key.to_string(), index);
            }
        }
        Self {
            records: records.into(),
            by_key,
            by_external_key,
            generation,
            loaded_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn records(&self) -> Arc<[R]> {
        Arc::clone(&self.records)
    }

    pub fn get(&self, key: i64) -> Option<&R> {
        self.by_key.get(&key).map(|index| &self.records[*index])
    }

    pub fn get_by_external_key(&self, external_key: &str) -> Option<&R> {
        self.by_external_key
            .get(external_key)
            .map(|index| &self.records[*index])
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> OffsetDateTime {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

type RefreshResult<R> = Result<Arc<Snapshot<R>>, CacheError>;

struct RebuildState<R> {
    /// Highest request ticket answered by a completed scan.
    covered_through: u64,
    generation: u64,
    last: Option<RefreshResult<R>>,
}

pub struct RecordCache<R: Record> {
    backend: Arc<dyn RecordBackend>,
    config: CacheConfig,
    current: RwLock<Option<Arc<Snapshot<R>>>>,
    loading: AtomicBool,
    requests: AtomicU64,
    rebuild: Mutex<RebuildState<R>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> RecordCache<R> {
    pub fn new(backend: Arc<dyn RecordBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            current: RwLock::new(None),
            loading: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            rebuild: Mutex::new(RebuildState {
                covered_through: 0,
                generation: 0,
                last: None,
            }),
            _record: PhantomData,
        }
    }

    pub fn state(&self) -> CacheState {
        if self.loading.load(Ordering::SeqCst) {
            CacheState::Loading
        } else if self.current().is_some() {
            CacheState::Ready
        } else {
            CacheState::Empty
        }
    }

    /// Generation of the current snapshot, if one is loaded.
    pub fn generation(&self) -> Option<u64> {
        self.current().map(|snapshot| snapshot.generation())
    }

    /// Rebuild from a full scan, coalescing with concurrent callers.
    pub async fn refresh(&self) -> RefreshResult<R> {
        if !self.config.enabled {
            return self.scan_detached().await;
        }
        let ticket = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.rebuild_for(ticket, false).await
    }

    /// The latest ready snapshot, loading it first when the cache is empty.
    pub async fn snapshot(&self) -> RefreshResult<R> {
        if !self.config.enabled {
            return self.scan_detached().await;
        }
        if let Some(current) = self.current() {
            return Ok(current);
        }
        let ticket = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.rebuild_for(ticket, true).await
    }

    pub async fn read_all(&self) -> Result<Arc<[R]>, CacheError> {
        Ok(self.snapshot().await?.records())
    }

    pub async fn get(&self, key: i64) -> Result<Option<R>, CacheError> {
        Ok(self.snapshot().await?.get(key).cloned())
    }

    pub async fn get_by_external_key(&self, external_key: &str) -> Result<Option<R>, CacheError> {
        Ok(self
            .snapshot()
            .await?
            .get_by_external_key(external_key)
            .cloned())
    }

    fn current(&self) -> Option<Arc<Snapshot<R>>> {
        rw_read(&self.current, SOURCE, "current").clone()
    }

    async fn rebuild_for(&self, ticket: u64, accept_current: bool) -> RefreshResult<R> {
        let mut state = self.rebuild.lock().await;

        if accept_current && let Some(current) = self.current() {
            return Ok(current);
        }
        if state.covered_through >= ticket
            && let Some(last) = state.last.clone()
        {
            counter!(METRIC_CACHE_REFRESH_COALESCED_TOTAL, "kind" => R::KIND.as_str())
                .increment(1);
            debug!(
                kind = %R::KIND,
                ticket,
                covered_through = state.covered_through,
                "Cache refresh coalesced"
            );
            return last;
        }

        // Every ticket up to here was issued before this scan begins.
        let covers = self.requests.load(Ordering::SeqCst);
        self.loading.store(true, Ordering::SeqCst);
        let started_at = Instant::now();
        let scanned = self.scan().await;
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_CACHE_REFRESH_MS, "kind" => R::KIND.as_str()).record(elapsed_ms);

        let result = match scanned {
            Ok(records) => {
                state.generation += 1;
                let snapshot = Arc::new(Snapshot::build(records, state.generation));
                *rw_write(&self.current, SOURCE, "swap") = Some(Arc::clone(&snapshot));
                info!(
                    kind = %R::KIND,
                    generation = snapshot.generation(),
                    records = snapshot.len(),
                    elapsed_ms,
                    "Cache snapshot rebuilt"
                );
                Ok(snapshot)
            }
            Err(source) => {
                counter!(METRIC_CACHE_REFRESH_FAILED_TOTAL, "kind" => R::KIND.as_str())
                    .increment(1);
                warn!(
                    kind = %R::KIND,
                    error = %source,
                    kept_generation = ?self.generation(),
                    "Cache refresh failed; keeping previous snapshot"
                );
                Err(CacheError::Refresh {
                    kind: R::KIND,
                    source,
                })
            }
        };
        self.loading.store(false, Ordering::SeqCst);

        state.covered_through = covers;
        state.last = Some(result.clone());
        result
    }

    async fn scan(&self) -> Result<Vec<R>, RepoError> {
        self.backend
            .scan(R::KIND, None)
            .await?
            .into_iter()
            .map(StoredRow::into_record::<R>)
            .collect()
    }

    async fn scan_detached(&self) -> RefreshResult<R> {
        let records = self
            .scan()
            .await
            .map_err(|source| CacheError::Refresh {
                kind: R::KIND,
                source,
            })?;
        Ok(Arc::new(Snapshot::build(records, 0)))
    }
}

#[async_trait]
impl<R: Record> RecordListener<R> for RecordCache<R> {
    fn name(&self) -> &str {
        "record_cache"
    }

    async fn on_event(&self, event: &StorageEvent<R>) -> Result<(), ListenerError> {
        if !self.config.enabled {
            return Ok(());
        }
        debug!(
            kind = %event.kind,
            event_id = %event.id,
            operation = event.operation.as_str(),
            "Cache invalidated by storage event"
        );
        self.refresh().await.map(|_| ()).map_err(|err| {
            ListenerError::new(format_args!("{err}: {}", source_of(&err)))
        })
    }
}

fn source_of(err: &CacheError) -> &RepoError {
    match err {
        CacheError::Refresh { source, .. } => source,
    }
}
