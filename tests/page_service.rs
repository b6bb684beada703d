use std::sync::Arc;

use folio::application::ids::IdGenerator;
use folio::application::pages::{NewPage, PageError, PageService, PageUpdate};
use folio::application::repos::RepoError;
use folio::application::storage::AdminStorage;
use folio::cache::{CacheConfig, NotificationBus, RecordCache};
use folio::domain::entities::{
    PageRecord, ParameterRecord, Record, RecordMeta, ResourceRecord, UriRecord,
};
use folio::domain::pages::source_checksum;
use folio::domain::types::{HttpOperation, RecordKind, ResourceKind, SortSpec};
use folio::infra::memory::InMemoryRecordBackend;

fn setup() -> (Arc<InMemoryRecordBackend>, AdminStorage) {
    let backend = Arc::new(InMemoryRecordBackend::new());
    let storage = AdminStorage::new(
        backend.clone(),
        Arc::new(IdGenerator::new()),
        Arc::new(NotificationBus::empty()),
    );
    (backend, storage)
}

fn new_page(name: &str) -> NewPage {
    NewPage {
        name: name.to_string(),
        html_source: format!("<main>{name}</main>"),
        content_type: None,
    }
}

#[tokio::test]
async fn create_adds_page_and_resource_entry() {
    let (_, storage) = setup();
    let pages = PageService::new(storage.clone());

    let created = pages.create(new_page("  About  ")).await.expect("create");
    assert!(created.dependents.is_ok());

    let page = created.page;
    assert_eq!(page.name, "About");
    assert_eq!(page.checksum, source_checksum("<main>  About  </main>"));

    let external_key = page.external_key().expect("external key");
    let resource: ResourceRecord = storage
        .get_by_external_key(external_key)
        .await
        .expect("resource entry");
    assert_eq!(resource.name, "About");
    assert_eq!(resource.kind, ResourceKind::Page);
}

#[tokio::test]
async fn create_rejects_blank_input() {
    let (backend, storage) = setup();
    let pages = PageService::new(storage);

    let err = pages
        .create(NewPage {
            name: "   ".into(),
            html_source: "<p/>".into(),
            content_type: None,
        })
        .await
        .expect_err("blank name");
    assert!(matches!(err, PageError::Domain(_)));

    let err = pages
        .create(NewPage {
            name: "Home".into(),
            html_source: "  ".into(),
            content_type: None,
        })
        .await
        .expect_err("blank source");
    assert!(matches!(err, PageError::Domain(_)));
    assert_eq!(backend.len(RecordKind::Page), 0);
}

#[tokio::test]
async fn update_recomputes_checksum_and_renames_resource() {
    let (_, storage) = setup();
    let pages = PageService::new(storage.clone());
    let page = pages.create(new_page("Home")).await.expect("create").page;
    let key = page.key().expect("key");

    let updated = pages
        .update(
            key,
            PageUpdate {
                name: Some("Start".into()),
                html_source: Some("<main>new</main>".into()),
                content_type: None,
            },
        )
        .await
        .expect("update");

    assert!(updated.dependents.is_ok());
    assert_eq!(updated.page.name, "Start");
    assert_eq!(updated.page.checksum, source_checksum("<main>new</main>"));
    assert_ne!(updated.page.checksum, page.checksum);

    let resource: ResourceRecord = storage
        .get_by_external_key(page.external_key().expect("external key"))
        .await
        .expect("resource");
    assert_eq!(resource.name, "Start");
}

#[tokio::test]
async fn update_recreates_a_missing_resource_entry() {
    let (_, storage) = setup();
    let pages = PageService::new(storage.clone());
    let page = pages.create(new_page("Home")).await.expect("create").page;
    let external_key = page.external_key().expect("external key").to_string();

    storage
        .delete_by_external_key::<ResourceRecord>(&external_key)
        .await
        .expect("drop resource");

    pages
        .update(page.key().expect("key"), PageUpdate::default())
        .await
        .expect("update");

    let resource: ResourceRecord = storage
        .get_by_external_key(&external_key)
        .await
        .expect("recreated");
    assert_eq!(resource.name, "Home");
}

#[tokio::test]
async fn delete_cascades_to_dependents() {
    let (backend, storage) = setup();
    let pages = PageService::new(storage.clone());
    let keep = pages.create(new_page("Keep")).await.expect("create").page;
    let page = pages.create(new_page("Drop")).await.expect("create").page;
    let external_key = page.external_key().expect("external key").to_string();

    for (owner, name) in [
        (external_key.as_str(), "title"),
        (external_key.as_str(), "lang"),
        (keep.external_key().expect("external key"), "title"),
    ] {
        storage
            .add(ParameterRecord {
                meta: RecordMeta::default(),
                name: name.into(),
                value: "x".into(),
                owner_external_key: owner.into(),
            })
            .await
            .expect("parameter");
    }

    let deleted = pages
        .delete(page.key().expect("key"))
        .await
        .expect("delete");
    assert!(deleted.dependents.is_ok());
    assert_eq!(deleted.page.name, "Drop");

    assert_eq!(backend.len(RecordKind::Page), 1);
    assert_eq!(backend.len(RecordKind::Resource), 1);
    let remaining = pages.parameters(&keep).await.expect("parameters");
    assert_eq!(remaining.len(), 1);
    assert_eq!(backend.len(RecordKind::Parameter), 1);
    assert!(matches!(
        storage
            .get_by_external_key::<ResourceRecord>(&external_key)
            .await,
        Err(RepoError::NotFound { .. })
    ));
}

#[tokio::test]
async fn delete_of_a_missing_page_is_not_found() {
    let (_, storage) = setup();
    let pages = PageService::new(storage);
    let err = pages.delete(77).await.expect_err("absent");
    assert!(matches!(err, PageError::Repo(RepoError::NotFound { .. })));
}

#[tokio::test]
async fn links_returns_uris_for_the_page() {
    let (_, storage) = setup();
    let pages = PageService::new(storage.clone());
    let page = pages.create(new_page("Docs")).await.expect("create").page;
    let external_key = page.external_key().expect("external key");

    for (uri, target) in [("/docs", external_key), ("/other", "elsewhere")] {
        storage
            .add(UriRecord {
                meta: RecordMeta::default(),
                uri: uri.into(),
                resource_external_key: target.into(),
                http_operation: HttpOperation::Get,
                enabled: true,
            })
            .await
            .expect("uri");
    }

    let links = pages.links(&page).await.expect("links");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].uri, "/docs");
}

#[tokio::test]
async fn cached_reads_match_storage() {
    let backend = Arc::new(InMemoryRecordBackend::new());
    let cache = Arc::new(RecordCache::<PageRecord>::new(
        backend.clone(),
        CacheConfig::default(),
    ));
    let bus = NotificationBus::builder()
        .subscribe::<PageRecord>(cache.clone())
        .build();
    let storage = AdminStorage::new(
        backend.clone(),
        Arc::new(IdGenerator::new()),
        Arc::new(bus),
    );
    let pages = PageService::new(storage).with_cache(cache);

    let b = pages.create(new_page("Beta")).await.expect("create").page;
    let a = pages.create(new_page("Alpha")).await.expect("create").page;

    let by_key = pages.get(b.key().expect("key")).await.expect("get");
    assert_eq!(by_key.name, "Beta");
    let by_external = pages
        .get_by_external_key(a.external_key().expect("external key"))
        .await
        .expect("get");
    assert_eq!(by_external.name, "Alpha");

    let in_key_order: Vec<String> = pages
        .list(None)
        .await
        .expect("list")
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(in_key_order, vec!["Beta", "Alpha"]);

    let by_name: Vec<String> = pages
        .list(Some(SortSpec::ascending("name")))
        .await
        .expect("list")
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(by_name, vec!["Alpha", "Beta"]);

    assert!(matches!(
        pages.get(9_999).await,
        Err(PageError::Repo(RepoError::NotFound { .. }))
    ));
}
