//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "folio";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:3000/uploads/";
const DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_URL_TTL_SECS: u64 = 3600;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

/// Command-line arguments for the Folio binary.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Folio content administration")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FOLIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Apply pending database migrations.
    Migrate,
    /// Manage uploaded files.
    #[command(subcommand)]
    Files(FilesCommand),
    /// Manage pages.
    #[command(subcommand)]
    Pages(PagesCommand),
}

#[derive(Debug, Subcommand, Clone)]
pub enum FilesCommand {
    /// Upload a new file, or replace the payload of an existing one.
    Upload(FileUploadArgs),
    /// List stored files.
    List(FileListArgs),
    /// Delete a file and its payload.
    Delete(KeyArgs),
    /// Print a signed serving URL for a file.
    Url(FileUrlArgs),
}

#[derive(Debug, Subcommand, Clone)]
pub enum PagesCommand {
    /// Create a page from an HTML source file.
    Create(PageCreateArgs),
    /// List pages.
    List(PageListArgs),
    /// Delete a page with its parameters and resource entry.
    Delete(KeyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct FileUploadArgs {
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub path: PathBuf,

    /// Replace the payload of the file with this key.
    #[arg(long = "replace", value_name = "KEY")]
    pub replace: Option<i64>,

    /// Display name; defaults to the uploaded filename.
    #[arg(long)]
    pub name: Option<String>,

    /// Content type; guessed from the filename when omitted.
    #[arg(long = "content-type", value_name = "MIME")]
    pub content_type: Option<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct FileListArgs {
    /// Only list files in this category (image, video, audio, application).
    #[arg(long)]
    pub category: Option<String>,

    /// Sort by this record field.
    #[arg(long = "sort-by", value_name = "FIELD")]
    pub sort_by: Option<String>,

    #[arg(long, action = clap::ArgAction::SetTrue, requires = "sort_by")]
    pub descending: bool,
}

#[derive(Debug, Args, Clone)]
pub struct FileUrlArgs {
    pub key: i64,

    /// Requested rendition width in pixels.
    #[arg(long)]
    pub size: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    pub key: i64,
}

#[derive(Debug, Args, Clone)]
pub struct PageCreateArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long = "source", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub source: PathBuf,

    #[arg(long = "content-type", value_name = "MIME")]
    pub content_type: Option<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct PageListArgs {
    /// Sort by this record field.
    #[arg(long = "sort-by", value_name = "FIELD")]
    pub sort_by: Option<String>,

    #[arg(long, action = clap::ArgAction::SetTrue, requires = "sort_by")]
    pub descending: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the log level (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Emit JSON formatted logs.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the uploads directory.
    #[arg(
        long = "uploads-dir",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub uploads_directory: Option<PathBuf>,

    /// Maximum upload size in bytes.
    #[arg(long = "uploads-max-request-bytes", value_name = "BYTES", global = true)]
    pub uploads_max_request_bytes: Option<u64>,

    /// Enable or disable the record caches.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub cache_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub uploads: UploadsSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Records live in memory for the lifetime of the process when unset.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct UploadsSettings {
    pub directory: PathBuf,
    /// Always ends with `/` so blob references join beneath it.
    pub public_base_url: Url,
    pub max_request_bytes: NonZeroU64,
    pub signing_key: String,
    pub url_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub warm_on_startup: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FOLIO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    uploads: RawUploadsSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(directory) = overrides.uploads_directory.as_ref() {
            self.uploads.directory = Some(directory.clone());
        }
        if let Some(limit) = overrides.uploads_max_request_bytes {
            self.uploads.max_request_bytes = Some(limit);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            uploads,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            uploads: build_uploads_settings(uploads)?,
            cache: CacheSettings {
                enabled: cache.enabled.unwrap_or(true),
                warm_on_startup: cache.warm_on_startup.unwrap_or(false),
            },
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max).ok_or_else(|| {
        LoadError::invalid("database.max_connections", "must be greater than zero")
    })?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_uploads_settings(uploads: RawUploadsSettings) -> Result<UploadsSettings, LoadError> {
    let directory = uploads
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "uploads.directory",
            "path must not be empty",
        ));
    }

    let base = uploads
        .public_base_url
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
    let public_base_url = parse_base_url(base.trim())
        .map_err(|reason| LoadError::invalid("uploads.public_base_url", reason))?;

    let max_request_bytes = NonZeroU64::new(
        uploads
            .max_request_bytes
            .unwrap_or(DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES),
    )
    .ok_or_else(|| LoadError::invalid("uploads.max_request_bytes", "must be greater than zero"))?;

    let signing_key = uploads
        .signing_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| LoadError::invalid("uploads.signing_key", "must be set"))?;

    let ttl = uploads.url_ttl_seconds.unwrap_or(DEFAULT_URL_TTL_SECS);
    if ttl == 0 {
        return Err(LoadError::invalid(
            "uploads.url_ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UploadsSettings {
        directory,
        public_base_url,
        max_request_bytes,
        signing_key,
        url_ttl: Duration::from_secs(ttl),
    })
}

fn parse_base_url(value: &str) -> Result<Url, String> {
    let normalized = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    };
    let url = Url::parse(&normalized).map_err(|err| format!("invalid url `{value}`: {err}"))?;
    if url.cannot_be_a_base() {
        return Err(format!("`{value}` cannot be used as a base url"));
    }
    Ok(url)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadsSettings {
    directory: Option<PathBuf>,
    public_base_url: Option<String>,
    max_request_bytes: Option<u64>,
    signing_key: Option<String>,
    url_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    warm_on_startup: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
