//! Error types for supervision, channel and hot-swap operations

use thiserror::Error;

/// Result type for library operations
pub type Result<T> = std::result::Result<T, LlamadError>;

/// Every failure the supervision layer can report.
///
/// Only `Spawn`, `ReadinessTimeout` and `RuntimeCrash` consume a supervisor's
/// restart budget; see [`LlamadError::counts_as_crash`].
#[derive(Debug, Error)]
pub enum LlamadError {
    /// Missing interpreter, missing script, port owned by a foreign process.
    /// Fatal for the attempt and never retried.
    #[error("configuration error for {service}: {reason}")]
    Configuration { service: String, reason: String },

    #[error("failed to spawn {service}: {reason}")]
    Spawn { service: String, reason: String },

    #[error("{service} did not become ready within {timeout_ms}ms")]
    ReadinessTimeout { service: String, timeout_ms: u64 },

    #[error("{service} exited unexpectedly ({detail})")]
    RuntimeCrash { service: String, detail: String },

    #[error("channel error: {0}")]
    Channel(String),

    #[error("malformed frame: {0}")]
    ProtocolDecode(String),

    #[error("model swap failed after {attempts} attempts: {message}")]
    SwapFailure { attempts: u32, message: String },

    /// Overlapping lifecycle call on a supervisor that is mid-start.
    #[error("{service} is busy ({phase})")]
    Busy { service: String, phase: String },

    /// Readiness wait aborted because the owner is tearing down.
    #[error("{service} startup cancelled")]
    Cancelled { service: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LlamadError {
    /// Whether this failure is charged against the restart budget.
    #[must_use]
    pub fn counts_as_crash(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::ReadinessTimeout { .. } | Self::RuntimeCrash { .. }
        )
    }

    pub(crate) fn config(service: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_classification() {
        assert!(
            LlamadError::Spawn {
                service: "inference".into(),
                reason: "ENOENT".into()
            }
            .counts_as_crash()
        );
        assert!(
            LlamadError::ReadinessTimeout {
                service: "inference".into(),
                timeout_ms: 10_000
            }
            .counts_as_crash()
        );
        assert!(!LlamadError::config("inference", "python not found").counts_as_crash());
        assert!(!LlamadError::Channel("reset".into()).counts_as_crash());
    }
}
