//! Soft failures: logged, counted, never propagated.

use std::fmt;

use metrics::counter;
use tracing::warn;

const METRIC_SOFT_FAILURE_TOTAL: &str = "folio_soft_failure_total";

/// Result of a step whose failure must not reach the caller as an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SoftOutcome {
    #[default]
    Ok,
    SoftFailure { site: &'static str, reason: String },
}

impl SoftOutcome {
    /// Record a soft failure at `site`.
    pub fn failure(site: &'static str, reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        warn!(site, reason = %reason, "Soft failure recorded");
        counter!(METRIC_SOFT_FAILURE_TOTAL, "site" => site).increment(1);
        Self::SoftFailure { site, reason }
    }

    /// Wrap a fallible step, turning its error into a soft failure.
    pub fn from_result<T, E: fmt::Display>(site: &'static str, result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => Self::failure(site, err),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_soft_failure(&self) -> bool {
        !self.is_ok()
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::SoftFailure { reason, .. } => Some(reason),
        }
    }

    /// Combine two outcomes; the first failure keeps its site and later
    /// reasons are appended.
    pub fn and(self, other: SoftOutcome) -> SoftOutcome {
        match (self, other) {
            (Self::Ok, other) => other,
            (failure, Self::Ok) => failure,
            (
                Self::SoftFailure { site, reason },
                Self::SoftFailure {
                    reason: other_reason,
                    ..
                },
            ) => Self::SoftFailure {
                site,
                reason: format!("{reason}; {other_reason}"),
            },
        }
    }
}
