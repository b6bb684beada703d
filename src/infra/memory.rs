//! In-process record backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::application::repos::{
    FieldFilter, RecordBackend, RepoError, RowDraft, StoredRow, sort_rows,
};
use crate::domain::types::{RecordKind, SortSpec};

#[derive(Default)]
struct KindTable {
    rows: BTreeMap<i64, StoredRow>,
    by_external_key: HashMap<String, i64>,
}

impl KindTable {
    fn remove(&mut self, key: i64) -> Option<StoredRow> {
        let row = self.rows.remove(&key)?;
        self.by_external_key.remove(&row.external_key);
        Some(row)
    }
}

/// Record backend holding every kind in a concurrent map.
///
/// Each operation locks the table of a single kind, which makes every
/// mutation atomic per row.
pub struct InMemoryRecordBackend {
    tables: DashMap<RecordKind, KindTable>,
    next_key: AtomicI64,
}

impl InMemoryRecordBackend {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_key: AtomicI64::new(1),
        }
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.tables.get(&kind).map_or(0, |table| table.rows.len())
    }
}

impl Default for InMemoryRecordBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordBackend for InMemoryRecordBackend {
    async fn insert(&self, kind: RecordKind, draft: RowDraft) -> Result<StoredRow, RepoError> {
        let mut table = self.tables.entry(kind).or_default();
        if table.by_external_key.contains_key(&draft.external_key) {
            return Err(RepoError::Conflict {
                kind,
                external_key: draft.external_key,
            });
        }
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let row = draft.into_row(key);
        table.by_external_key.insert(row.external_key.clone(), key);
        table.rows.insert(key, row.clone());
        Ok(row)
    }

    async fn get(&self, kind: RecordKind, key: i64) -> Result<Option<StoredRow>, RepoError> {
        Ok(self
            .tables
            .get(&kind)
            .and_then(|table| table.rows.get(&key).cloned()))
    }

    async fn get_by_external_key(
        &self,
        kind: RecordKind,
        external_key: &str,
    ) -> Result<Option<StoredRow>, RepoError> {
        Ok(self.tables.get(&kind).and_then(|table| {
            table
                .by_external_key
                .get(external_key)
                .and_then(|key| table.rows.get(key).cloned())
        }))
    }

    async fn update(&self, kind: RecordKind, row: StoredRow) -> Result<StoredRow, RepoError> {
        let mut table = self.tables.entry(kind).or_default();
        let Some(existing) = table.rows.get_mut(&row.key) else {
            return Err(RepoError::not_found(kind, row.key));
        };
        existing.fields = row.fields;
        existing.last_modified = row.last_modified;
        Ok(existing.clone())
    }

    async fn delete(&self, kind: RecordKind, key: i64) -> Result<Option<StoredRow>, RepoError> {
        Ok(self
            .tables
            .get_mut(&kind)
            .and_then(|mut table| table.remove(key)))
    }

    async fn delete_by_external_key(
        &self,
        kind: RecordKind,
        external_key: &str,
    ) -> Result<Option<StoredRow>, RepoError> {
        Ok(self.tables.get_mut(&kind).and_then(|mut table| {
            let key = table.by_external_key.get(external_key).copied()?;
            table.remove(key)
        }))
    }

    async fn delete_where(
        &self,
        kind: RecordKind,
        filter: &FieldFilter,
    ) -> Result<u64, RepoError> {
        let Some(mut table) = self.tables.get_mut(&kind) else {
            return Ok(0);
        };
        let doomed: Vec<i64> = table
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .map(|row| row.key)
            .collect();
        for key in &doomed {
            table.remove(*key);
        }
        Ok(doomed.len() as u64)
    }

    async fn query(
        &self,
        kind: RecordKind,
        filter: &FieldFilter,
    ) -> Result<Vec<StoredRow>, RepoError> {
        Ok(self.tables.get(&kind).map_or_else(Vec::new, |table| {
            table
                .rows
                .values()
                .filter(|row| filter.matches(row))
                .cloned()
                .collect()
        }))
    }

    async fn scan(
        &self,
        kind: RecordKind,
        sort: Option<&SortSpec>,
    ) -> Result<Vec<StoredRow>, RepoError> {
        let mut rows: Vec<StoredRow> = self
            .tables
            .get(&kind)
            .map_or_else(Vec::new, |table| table.rows.values().cloned().collect());
        sort_rows(&mut rows, sort);
        Ok(rows)
    }
}
