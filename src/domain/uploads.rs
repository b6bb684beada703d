//! Upload-specific helpers and invariants.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;

const INLINE_PREVIEW_PREFIXES: &[&str] = &["image/", "video/", "audio/", "text/"];
const INLINE_PREVIEW_EXACT: &[&str] = &["application/pdf"];

const MAX_CONTENT_TYPE_LEN: usize = 255;

/// Opaque reference to a stored blob, assigned by the blob backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Determine whether the provided MIME type can be served inline.
pub fn supports_inline_preview(content_type: &str) -> bool {
    INLINE_PREVIEW_PREFIXES
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
        || INLINE_PREVIEW_EXACT.contains(&content_type)
}

/// `Content-Disposition` value for serving a file.
pub fn content_disposition(content_type: &str, file_name: &str) -> String {
    let mode = if supports_inline_preview(content_type) {
        "inline"
    } else {
        "attachment"
    };
    let escaped = file_name.replace(['"', '\\'], "_");
    format!("{mode}; filename=\"{escaped}\"")
}

/// Validate an operator-supplied serving type (`type/subtype`).
pub fn normalize_content_type(value: &str) -> Result<String, DomainError> {
    let lowered = value.trim().to_ascii_lowercase();
    let valid = lowered.len() <= MAX_CONTENT_TYPE_LEN
        && lowered
            .split_once('/')
            .is_some_and(|(top, sub)| is_token(top) && is_token(sub));
    if !valid {
        return Err(DomainError::validation(
            "adjusted_content_type",
            format!("`{value}` is not a valid content type"),
        ));
    }
    Ok(lowered)
}

pub fn normalize_file_name(name: &str) -> Result<String, DomainError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("name", "file name is required"));
    }
    Ok(trimmed.to_string())
}

fn is_token(part: &str) -> bool {
    !part.is_empty()
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'.' | b'_'))
}
