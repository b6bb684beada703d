//! Content-type classification for uploaded blobs.

use crate::domain::types::ContentCategory;

/// Derived view of a declared content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ContentCategory,
    pub adjusted_content_type: String,
}

const TEXT_PREFIX: &str = "text/";

/// Filename suffixes whose serving type overrides a generic `text/*` declaration.
const TEXT_OVERRIDES: &[(&str, &str)] = &[
    (".js", "text/javascript"),
    (".css", "text/css"),
    (".html", "text/html"),
];

/// Classify a declared content type.
///
/// The category is the first case-insensitive prefix match among image, video,
/// audio and application; anything else falls back to application. There is
/// no text category, so `text/*` uploads land in application while their
/// serving type may still be corrected from the filename suffix.
pub fn classify(raw_content_type: &str, filename: &str) -> Classification {
    let lowered = raw_content_type.trim().to_ascii_lowercase();

    let category = ContentCategory::ALL
        .into_iter()
        .find(|category| lowered.starts_with(category.as_str()))
        .unwrap_or(ContentCategory::Application);

    let adjusted_content_type = if lowered.starts_with(TEXT_PREFIX) {
        text_override(filename).map_or(lowered.clone(), str::to_string)
    } else {
        lowered
    };

    Classification {
        category,
        adjusted_content_type,
    }
}

fn text_override(filename: &str) -> Option<&'static str> {
    let lowered = filename.trim().to_ascii_lowercase();
    // Later entries win, matching a cascade of suffix checks.
    TEXT_OVERRIDES
        .iter()
        .rev()
        .find(|(suffix, _)| lowered.ends_with(suffix))
        .map(|(_, content_type)| *content_type)
}
