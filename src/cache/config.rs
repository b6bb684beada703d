//! Cache configuration.
//!
//! Controls the per-type snapshot caches via `folio.toml`.

use serde::Deserialize;

/// Cache configuration from `folio.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve reads from snapshots. When off, every read scans the backend.
    pub enabled: bool,
    /// Load every snapshot before serving the first command.
    pub warm_on_startup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warm_on_startup: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            warm_on_startup: settings.warm_on_startup,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert!(!config.warm_on_startup);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"warm_on_startup": true}"#).expect("valid json");
        assert!(config.enabled);
        assert!(config.warm_on_startup);
        assert!(!CacheConfig::disabled().enabled);
    }
}
