use std::collections::HashSet;
use std::sync::Arc;

use folio::application::ids::IdGenerator;
use folio::application::repos::RepoError;
use folio::application::storage::AdminStorage;
use folio::cache::NotificationBus;
use folio::domain::entities::{ParameterRecord, Record, RecordMeta, UriRecord};
use folio::domain::types::{HttpOperation, QueryOperator, SortSpec};
use folio::infra::memory::InMemoryRecordBackend;

fn storage() -> AdminStorage {
    AdminStorage::new(
        Arc::new(InMemoryRecordBackend::new()),
        Arc::new(IdGenerator::new()),
        Arc::new(NotificationBus::empty()),
    )
}

fn parameter(name: &str, value: &str, owner: &str) -> ParameterRecord {
    ParameterRecord {
        meta: RecordMeta::default(),
        name: name.to_string(),
        value: value.to_string(),
        owner_external_key: owner.to_string(),
    }
}

#[tokio::test]
async fn add_assigns_keys_and_round_trips() {
    let storage = storage();
    let added = storage
        .add(parameter("color", "blue", "page-1"))
        .await
        .expect("add parameter");

    let key = added.key().expect("primary key assigned");
    let external_key = added.external_key().expect("external key assigned");
    assert!(!external_key.is_empty());
    assert!(added.last_modified().is_some());

    let fetched: ParameterRecord = storage.get(key).await.expect("get by key");
    assert_eq!(fetched, added);

    let by_external: ParameterRecord = storage
        .get_by_external_key(external_key)
        .await
        .expect("get by external key");
    assert_eq!(by_external.key(), Some(key));
}

#[tokio::test]
async fn add_keeps_a_preset_external_key() {
    let storage = storage();
    let mut record = parameter("lang", "en", "page-1");
    record.meta = RecordMeta::with_external_key("preset-key");

    let added = storage.add(record).await.expect("add");
    assert_eq!(added.external_key(), Some("preset-key"));

    let duplicate = {
        let mut record = parameter("lang", "fr", "page-2");
        record.meta = RecordMeta::with_external_key("preset-key");
        storage.add_with_key(record).await
    };
    assert!(matches!(duplicate, Err(RepoError::Conflict { .. })));
}

#[tokio::test]
async fn add_with_key_requires_an_external_key() {
    let storage = storage();
    let err = storage
        .add_with_key(parameter("a", "b", "c"))
        .await
        .expect_err("missing external key");
    assert!(matches!(err, RepoError::Validation { .. }));
}

#[tokio::test]
async fn update_preserves_identity_and_advances_last_modified() {
    let storage = storage();
    let added = storage
        .add(parameter("color", "blue", "page-1"))
        .await
        .expect("add");

    let mut changed = added.clone();
    changed.value = "green".to_string();
    // Keys come from the stored copy, not the caller.
    changed.meta.external_key = Some("tampered".to_string());
    let mut previous = added.last_modified().expect("timestamp");

    for round in 0..5 {
        changed.value = format!("green-{round}");
        let updated = storage.update(changed.clone()).await.expect("update");
        assert_eq!(updated.key(), added.key());
        assert_eq!(updated.external_key(), added.external_key());
        let stamp = updated.last_modified().expect("timestamp");
        assert!(stamp > previous, "last_modified must strictly increase");
        previous = stamp;
    }

    let fetched: ParameterRecord = storage
        .get(added.key().expect("key"))
        .await
        .expect("get");
    assert_eq!(fetched.value, "green-4");
}

#[tokio::test]
async fn update_of_a_missing_record_is_not_found() {
    let storage = storage();
    let mut ghost = parameter("x", "y", "z");
    ghost.meta.key = Some(4242);
    let err = storage.update(ghost).await.expect_err("absent");
    assert!(matches!(err, RepoError::NotFound { .. }));

    let unkeyed = storage
        .update(parameter("x", "y", "z"))
        .await
        .expect_err("no key");
    assert!(matches!(unkeyed, RepoError::Validation { .. }));
}

#[tokio::test]
async fn delete_returns_the_removed_record() {
    let storage = storage();
    let added = storage.add(parameter("a", "1", "o")).await.expect("add");
    let key = added.key().expect("key");

    let removed: ParameterRecord = storage.delete(key).await.expect("delete");
    assert_eq!(removed.name, "a");

    let again = storage.delete::<ParameterRecord>(key).await;
    assert!(matches!(again, Err(RepoError::NotFound { .. })));
    let gone = storage.get::<ParameterRecord>(key).await;
    assert!(matches!(gone, Err(RepoError::NotFound { .. })));
}

#[tokio::test]
async fn bulk_delete_removes_only_matches() {
    let storage = storage();
    for (name, owner) in [("a", "page-1"), ("b", "page-1"), ("c", "page-2")] {
        storage
            .add(parameter(name, "v", owner))
            .await
            .expect("seed");
    }

    let removed = storage
        .delete_where::<ParameterRecord>("owner_external_key", QueryOperator::Eq, "page-1")
        .await
        .expect("bulk delete");
    assert_eq!(removed, 2);

    let left: Vec<ParameterRecord> = storage.all_records(None).await.expect("scan");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].owner_external_key, "page-2");

    let none = storage
        .delete_where::<ParameterRecord>("owner_external_key", QueryOperator::Eq, "page-9")
        .await
        .expect("bulk delete");
    assert_eq!(none, 0);
}

#[tokio::test]
async fn query_compares_fields() {
    let storage = storage();
    for (uri, enabled) in [("/a", true), ("/b", false), ("/c", true)] {
        storage
            .add(UriRecord {
                meta: RecordMeta::default(),
                uri: uri.to_string(),
                resource_external_key: "res".to_string(),
                http_operation: HttpOperation::Get,
                enabled,
            })
            .await
            .expect("seed");
    }

    let enabled: Vec<UriRecord> = storage
        .query("enabled", QueryOperator::Eq, true)
        .await
        .expect("query");
    let uris: Vec<&str> = enabled.iter().map(|r| r.uri.as_str()).collect();
    assert_eq!(uris, vec!["/a", "/c"]);

    let after_a: Vec<UriRecord> = storage
        .query("uri", QueryOperator::Gt, "/a")
        .await
        .expect("query");
    assert_eq!(after_a.len(), 2);

    let missing_field: Vec<UriRecord> = storage
        .query("nonexistent", QueryOperator::Eq, "x")
        .await
        .expect("query");
    assert!(missing_field.is_empty());
}

#[tokio::test]
async fn all_records_sorts_by_field() {
    let storage = storage();
    for name in ["pear", "apple", "fig"] {
        storage
            .add(parameter(name, "v", "o"))
            .await
            .expect("seed");
    }

    let unsorted: Vec<ParameterRecord> = storage.all_records(None).await.expect("scan");
    let names: Vec<&str> = unsorted.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["pear", "apple", "fig"]);

    let ascending: Vec<ParameterRecord> = storage
        .all_records(Some(SortSpec::ascending("name")))
        .await
        .expect("scan");
    let names: Vec<&str> = ascending.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["apple", "fig", "pear"]);

    let descending: Vec<ParameterRecord> = storage
        .all_records(Some(SortSpec::descending("name")))
        .await
        .expect("scan");
    let names: Vec<&str> = descending.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["pear", "fig", "apple"]);
}

#[tokio::test]
async fn unique_ids_never_repeat() {
    let storage = storage();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            (0..250).map(|_| storage.unique_id()).collect::<Vec<_>>()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.expect("task") {
            assert!(seen.insert(id), "duplicate id");
        }
    }
    assert_eq!(seen.len(), 2000);
}
