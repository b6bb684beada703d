//! Persisted record types.
//!
//! Every record carries a [`RecordMeta`] owned by storage. The metadata is
//! kept out of the serialized body; backends store it in dedicated columns.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

use crate::domain::{
    types::{ContentCategory, HttpOperation, RecordKind, ResourceKind},
    uploads::BlobRef,
};

/// Storage-managed identity and timestamp of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMeta {
    /// Primary key assigned by the backend on insert. Immutable afterwards.
    pub key: Option<i64>,
    /// Caller-stable identifier assigned once at creation.
    pub external_key: Option<String>,
    /// UTC, millisecond precision, stamped on every mutation.
    pub last_modified: Option<OffsetDateTime>,
}

impl RecordMeta {
    pub fn with_external_key(external_key: impl Into<String>) -> Self {
        Self {
            external_key: Some(external_key.into()),
            ..Self::default()
        }
    }
}

/// A typed entity persisted through the record storage.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn key(&self) -> Option<i64> {
        self.meta().key
    }

    fn external_key(&self) -> Option<&str> {
        self.meta().external_key.as_deref()
    }

    fn last_modified(&self) -> Option<OffsetDateTime> {
        self.meta().last_modified
    }
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr) => {
        impl Record for $ty {
            const KIND: RecordKind = $kind;

            fn meta(&self) -> &RecordMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut RecordMeta {
                &mut self.meta
            }
        }
    };
}

/// Metadata for an uploaded file and the blob holding its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(skip)]
    pub meta: RecordMeta,
    pub name: String,
    #[serde(default)]
    pub blob_ref: Option<BlobRef>,
    pub content_type: String,
    pub adjusted_content_type: String,
    pub category: ContentCategory,
    pub hash: String,
    pub file_name: String,
    pub size: i64,
}

impl_record!(FileRecord, RecordKind::File);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    #[serde(skip)]
    pub meta: RecordMeta,
    pub name: String,
    pub html_source: String,
    /// SHA-256 of `html_source`, lowercase hex.
    pub checksum: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl_record!(PageRecord, RecordKind::Page);

/// Named value owned by a page through its external key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    #[serde(skip)]
    pub meta: RecordMeta,
    pub name: String,
    pub value: String,
    pub owner_external_key: String,
}

impl_record!(ParameterRecord, RecordKind::Parameter);

/// Cross-reference entry; its external key equals the referenced entity's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(skip)]
    pub meta: RecordMeta,
    pub name: String,
    pub kind: ResourceKind,
}

impl_record!(ResourceRecord, RecordKind::Resource);

impl ResourceRecord {
    pub fn for_page(page: &PageRecord) -> Option<Self> {
        let external_key = page.external_key()?;
        Some(Self {
            meta: RecordMeta::with_external_key(external_key),
            name: page.name.clone(),
            kind: ResourceKind::Page,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UriRecord {
    #[serde(skip)]
    pub meta: RecordMeta,
    pub uri: String,
    pub resource_external_key: String,
    pub http_operation: HttpOperation,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl_record!(UriRecord, RecordKind::Uri);

fn enabled_default() -> bool {
    true
}
