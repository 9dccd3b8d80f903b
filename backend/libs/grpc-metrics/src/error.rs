//! Error types for metric declaration and call interception

use crate::stream_type::StreamType;
use thiserror::Error;
use tonic::Status;

/// Result type for grpc-metrics operations
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Errors raised while wiring the interceptor or at the call boundary
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The procedure identifier is not of the form `/<package.Service>/<Method>`
    #[error("procedure in grpc metrics interceptor malformed: {0}")]
    MalformedProcedure(String),

    /// A streaming call shape was requested from a unary-only interceptor
    #[error("stream type {stream_type:?} is not supported by the metrics interceptor")]
    UnsupportedStreamType { stream_type: StreamType },

    /// A metric family was redeclared with a different shape
    #[error("metric family {name} already declared with a different shape")]
    ConflictingDeclaration { name: String },

    /// Prometheus rejected a metric definition
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Configuration could not be deserialized
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MetricsError {
    /// Create a malformed-procedure error
    pub fn malformed_procedure(procedure: impl Into<String>) -> Self {
        Self::MalformedProcedure(procedure.into())
    }
}

impl From<MetricsError> for Status {
    fn from(err: MetricsError) -> Self {
        Status::internal(err.to_string())
    }
}
