//! Page invariants.

use sha2::{Digest, Sha256};

use crate::domain::error::DomainError;

const MAX_NAME_LEN: usize = 200;

/// Checksum of a page source document, lowercase SHA-256 hex.
pub fn source_checksum(html_source: &str) -> String {
    hex::encode(Sha256::digest(html_source.as_bytes()))
}

/// Validate a page name and return it trimmed.
pub fn normalize_name(name: &str) -> Result<String, DomainError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("name", "page name is required"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::validation(
            "name",
            format!("page name must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_source(html_source: &str) -> Result<(), DomainError> {
    if html_source.trim().is_empty() {
        return Err(DomainError::validation(
            "html_source",
            "page source must not be empty",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_hex() {
        let first = source_checksum("<p>hello</p>");
        assert_eq!(first.len(), 64);
        assert_eq!(first, source_checksum("<p>hello</p>"));
        assert_ne!(first, source_checksum("<p>hello!</p>"));
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn names_are_trimmed_and_required() {
        assert_eq!(normalize_name("  About  ").expect("valid"), "About");
        assert!(matches!(
            normalize_name("   "),
            Err(DomainError::Validation { field: "name", .. })
        ));
        assert!(normalize_name(&"x".repeat(201)).is_err());
    }

    #[test]
    fn blank_source_is_rejected() {
        assert!(validate_source("\n\t").is_err());
        assert!(validate_source("<html></html>").is_ok());
    }
}
