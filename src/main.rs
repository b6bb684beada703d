use std::{path::Path, process, sync::Arc};

use folio::{
    application::{
        blobs::{BlobStore, BlobUpload},
        error::AppError,
        files::{FileService, FileUpload},
        ids::IdGenerator,
        outcome::SoftOutcome,
        pages::{NewPage, PageService},
        repos::RecordBackend,
        storage::AdminStorage,
    },
    cache::{CacheConfig, NotificationBus, RecordCache},
    config::{self, Command, FilesCommand, PagesCommand, Settings},
    domain::{
        entities::{FileRecord, PageRecord, Record},
        types::{ContentCategory, SortSpec},
    },
    infra::{
        db::PostgresRecordBackend, error::InfraError, memory::InMemoryRecordBackend, telemetry,
        uploads::FsBlobStore,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    let log = || {
        error!(
            kind = report.kind.as_str(),
            source = report.source,
            chain = ?report.messages,
            "application error"
        );
    };

    if dispatcher::has_been_set() {
        log();
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, log);
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(InfraError::from)?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Migrate => run_migrate(&settings).await,
        Command::Files(command) => {
            let app = build_application_context(&settings).await?;
            run_files(&app, command).await
        }
        Command::Pages(command) => {
            let app = build_application_context(&settings).await?;
            run_pages(&app, command).await
        }
    }
}

struct ApplicationContext {
    files: FileService,
    pages: PageService,
}

async fn run_migrate(settings: &Settings) -> Result<(), AppError> {
    let url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| AppError::validation("database.url is required to run migrations"))?;
    let pool = PostgresRecordBackend::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    PostgresRecordBackend::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;
    info!("Database migrations applied");
    Ok(())
}

async fn init_backend(settings: &Settings) -> Result<Arc<dyn RecordBackend>, AppError> {
    let Some(url) = settings.database.url.as_deref() else {
        warn!("database.url is not set; records are kept in memory and discarded on exit");
        return Ok(Arc::new(InMemoryRecordBackend::new()));
    };

    let pool = PostgresRecordBackend::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    let backend = PostgresRecordBackend::new(pool);
    backend.health_check().await.map_err(InfraError::from)?;
    Ok(Arc::new(backend))
}

async fn build_application_context(settings: &Settings) -> Result<ApplicationContext, AppError> {
    let backend = init_backend(settings).await?;
    let cache_config = CacheConfig::from(&settings.cache);

    let file_cache = Arc::new(RecordCache::<FileRecord>::new(
        Arc::clone(&backend),
        cache_config.clone(),
    ));
    let page_cache = Arc::new(RecordCache::<PageRecord>::new(
        Arc::clone(&backend),
        cache_config.clone(),
    ));

    let bus = NotificationBus::builder()
        .subscribe::<FileRecord>(file_cache.clone())
        .subscribe::<PageRecord>(page_cache.clone())
        .build();

    let storage = AdminStorage::new(
        Arc::clone(&backend),
        Arc::new(IdGenerator::new()),
        Arc::new(bus),
    );
    let blobs: Arc<dyn BlobStore> =
        Arc::new(FsBlobStore::new(&settings.uploads).map_err(InfraError::from)?);

    if cache_config.enabled && cache_config.warm_on_startup {
        let warmed = SoftOutcome::from_result("startup::warm_files", file_cache.refresh().await)
            .and(SoftOutcome::from_result(
                "startup::warm_pages",
                page_cache.refresh().await,
            ));
        if warmed.is_ok() {
            info!("Record caches warmed");
        }
    }

    let mut files = FileService::new(storage.clone(), blobs);
    let mut pages = PageService::new(storage);
    if cache_config.enabled {
        files = files.with_cache(file_cache);
        pages = pages.with_cache(page_cache);
    }

    Ok(ApplicationContext { files, pages })
}

async fn run_files(app: &ApplicationContext, command: FilesCommand) -> Result<(), AppError> {
    match command {
        FilesCommand::Upload(args) => {
            let data = tokio::fs::read(&args.path).await.map_err(InfraError::from)?;
            let filename = file_name_of(&args.path)?;
            let mutation = app
                .files
                .upload(FileUpload {
                    key: args.replace,
                    name: args.name,
                    blob: BlobUpload::from_bytes(filename, args.content_type, data),
                })
                .await?;
            report_cleanup(&mutation.cleanup);
            print_file(&mutation.record);
        }
        FilesCommand::List(args) => {
            let category = args
                .category
                .as_deref()
                .map(|value| {
                    ContentCategory::parse(value)
                        .ok_or_else(|| AppError::validation(format!("unknown category `{value}`")))
                })
                .transpose()?;
            let records = match sort_spec(args.sort_by, args.descending) {
                Some(sort) => app.files.list_sorted(sort, category).await?,
                None => app.files.list(category).await?,
            };
            for record in records {
                print_file(&record);
            }
        }
        FilesCommand::Delete(args) => {
            let mutation = app.files.delete(args.key).await?;
            report_cleanup(&mutation.cleanup);
            println!("deleted {}", mutation.record.name);
        }
        FilesCommand::Url(args) => {
            let record = app.files.get(args.key).await?;
            let reference = record.blob_ref.as_ref().ok_or_else(|| {
                AppError::validation(format!("file {} has no stored payload", args.key))
            })?;
            println!("{}", app.files.serve_url(reference, args.size)?);
        }
    }
    Ok(())
}

async fn run_pages(app: &ApplicationContext, command: PagesCommand) -> Result<(), AppError> {
    match command {
        PagesCommand::Create(args) => {
            let html_source = tokio::fs::read_to_string(&args.source)
                .await
                .map_err(InfraError::from)?;
            let mutation = app
                .pages
                .create(NewPage {
                    name: args.name,
                    html_source,
                    content_type: args.content_type,
                })
                .await?;
            report_cleanup(&mutation.dependents);
            print_page(&mutation.page);
        }
        PagesCommand::List(args) => {
            for page in app.pages.list(sort_spec(args.sort_by, args.descending)).await? {
                print_page(&page);
            }
        }
        PagesCommand::Delete(args) => {
            let mutation = app.pages.delete(args.key).await?;
            report_cleanup(&mutation.dependents);
            println!("deleted {}", mutation.page.name);
        }
    }
    Ok(())
}

fn sort_spec(sort_by: Option<String>, descending: bool) -> Option<SortSpec> {
    sort_by.map(|field| {
        if descending {
            SortSpec::descending(field)
        } else {
            SortSpec::ascending(field)
        }
    })
}

fn file_name_of(path: &Path) -> Result<String, AppError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::validation(format!("`{}` has no file name", path.display())))
}

fn report_cleanup(outcome: &SoftOutcome) {
    if let Some(reason) = outcome.reason() {
        warn!(reason, "operation succeeded with a soft failure");
    }
}

fn print_file(record: &FileRecord) {
    println!(
        "{}\t{}\t{}\t{}\t{} bytes",
        record.key().unwrap_or_default(),
        record.name,
        record.category,
        record.adjusted_content_type,
        record.size
    );
}

fn print_page(page: &PageRecord) {
    println!(
        "{}\t{}\t{}",
        page.key().unwrap_or_default(),
        page.external_key().unwrap_or_default(),
        page.name
    );
}
