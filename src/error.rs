//! # Error Types
//!
//! Custom error types for the glitch logger using `thiserror`.
//!
//! Only two classes of failure are fatal: configuration errors (before any
//! sampling begins) and sink write failures (data integrity can no longer be
//! guaranteed). Per-tick channel errors are accumulated into snapshot error
//! counters instead of being raised; an I/O timeout is fatal only once the
//! configured error budget is exhausted.

use thiserror::Error;

/// Main error type for the glitch logger
#[derive(Debug, Error)]
pub enum GlitchLoggerError {
    /// Configuration errors (malformed TOML or invalid values)
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Telemetry provider errors. `TelemetryProvider` implementations
    /// backed by a real transport return this from `connect` and
    /// `subscribe_alarm`; those failures are fatal at startup.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A channel read exceeded the configured I/O deadline. The sampling
    /// loop logs this and substitutes a defaulted reading; it becomes
    /// fatal only through the error budget.
    #[error("I/O timeout: {0}")]
    Timeout(String),

    /// Tabular sink write failure (fatal)
    #[error("Sink error: {0}")]
    Sink(String),

    /// Too many failed reads; the process should exit
    #[error("Error budget exceeded: {count} failed reads (budget {budget})")]
    ErrorBudgetExceeded { count: u64, budget: u64 },
}

/// Result type alias for the glitch logger
pub type Result<T> = std::result::Result<T, GlitchLoggerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_provider() {
        let err = GlitchLoggerError::Provider("channel unreachable".to_string());
        assert_eq!(err.to_string(), "Provider error: channel unreachable");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = GlitchLoggerError::Timeout("scalar read exceeded 100ms".to_string());
        assert_eq!(err.to_string(), "I/O timeout: scalar read exceeded 100ms");
    }

    #[test]
    fn test_error_display_sink() {
        let err = GlitchLoggerError::Sink("disk full".to_string());
        assert_eq!(err.to_string(), "Sink error: disk full");
    }

    #[test]
    fn test_error_display_budget() {
        let err = GlitchLoggerError::ErrorBudgetExceeded { count: 12, budget: 10 };
        assert_eq!(
            err.to_string(),
            "Error budget exceeded: 12 failed reads (budget 10)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GlitchLoggerError = io_err.into();
        assert!(matches!(err, GlitchLoggerError::Io(_)));
    }
}
