//! Error types for the generation benchmark harness
//!
//! Every fallible operation in the crate returns [`Result`]. Failures raised by
//! the model, tokenizer, or quantization collaborators are wrapped once in
//! [`BenchError::ExternalCall`] with the original error kept as the source.

use thiserror::Error;

/// Boxed error type returned by external collaborators
pub type ExternalError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used by collaborator traits
pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Error type for all harness operations
#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid or missing configuration (prompt, iteration counts, option combination)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A collaborator call failed; the run is terminated
    #[error("External call `{operation}` failed: {source}")]
    ExternalCall {
        /// Name of the collaborator operation
        operation: &'static str,
        /// Error raised by the collaborator, unmodified
        #[source]
        source: ExternalError,
    },

    /// Filesystem failure
    #[error("I/O error: {message}")]
    IoError {
        /// Description including the path involved
        message: String,
    },

    /// Malformed prompt pool or report serialization failure
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the problem
        reason: String,
    },
}

impl BenchError {
    /// Wrap a collaborator error for the named operation
    pub fn external(operation: &'static str, source: ExternalError) -> Self {
        Self::ExternalCall { operation, source }
    }

    /// Whether this error was raised by a collaborator rather than the harness
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalCall { .. })
    }
}

/// Attach an operation name to a collaborator result
pub(crate) trait ExternalContext<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> ExternalContext<T> for ExternalResult<T> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| BenchError::external(operation, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = BenchError::ConfigError("no prompt for 5000 tokens".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: no prompt for 5000 tokens"
        );
        assert!(!err.is_external());
    }

    #[test]
    fn test_external_error_keeps_source_message() {
        let source: ExternalError = "device lost".into();
        let err = BenchError::external("generate", source);
        assert!(err.is_external());
        assert_eq!(err.to_string(), "External call `generate` failed: device lost");
        let inner = std::error::Error::source(&err).expect("source");
        assert_eq!(inner.to_string(), "device lost");
    }

    #[test]
    fn test_during_maps_only_errors() {
        let ok: ExternalResult<u32> = Ok(7);
        assert_eq!(ok.during("encode").expect("ok"), 7);

        let failed: ExternalResult<u32> = Err("bad vocab".into());
        match failed.during("encode") {
            Err(BenchError::ExternalCall { operation, .. }) => assert_eq!(operation, "encode"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
