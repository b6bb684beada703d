//! Shared domain enumerations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Concrete record types known to storage.
///
/// Every persisted row is tagged with its kind; notifications and caches are
/// keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    File,
    Page,
    Parameter,
    Resource,
    Uri,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::File => "file",
            RecordKind::Page => "page",
            RecordKind::Parameter => "parameter",
            RecordKind::Resource => "resource",
            RecordKind::Uri => "uri",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse category derived from an upload's MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    Image,
    Video,
    Audio,
    Application,
}

impl ContentCategory {
    pub const ALL: [ContentCategory; 4] = [
        ContentCategory::Image,
        ContentCategory::Video,
        ContentCategory::Audio,
        ContentCategory::Application,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentCategory::Image => "image",
            ContentCategory::Video => "video",
            ContentCategory::Audio => "audio",
            ContentCategory::Application => "application",
        }
    }

    /// Parse a category name case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a resource entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Page,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpOperation {
    Get,
    Post,
    Put,
    Delete,
}

/// Comparison applied by field queries and bulk deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl QueryOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            QueryOperator::Eq => "=",
            QueryOperator::NotEq => "<>",
            QueryOperator::Lt => "<",
            QueryOperator::Le => "<=",
            QueryOperator::Gt => ">",
            QueryOperator::Ge => ">=",
        }
    }

    /// `Lt`, `Le`, `Gt` and `Ge` only hold between values of one JSON type.
    pub fn is_ordering(self) -> bool {
        !matches!(self, QueryOperator::Eq | QueryOperator::NotEq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Sort request for full scans: a record field name plus a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_ignores_case() {
        assert_eq!(ContentCategory::parse("IMAGE"), Some(ContentCategory::Image));
        assert_eq!(ContentCategory::parse(" audio "), Some(ContentCategory::Audio));
        assert_eq!(ContentCategory::parse("text"), None);
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let value = serde_json::to_value(RecordKind::Parameter).expect("serializable");
        assert_eq!(value, serde_json::json!("parameter"));
        assert_eq!(RecordKind::Uri.to_string(), "uri");
    }
}
