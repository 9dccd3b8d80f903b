//! Interceptor configuration
//!
//! The crate reads no files or environment variables itself. Hosts compose a
//! `config::Config` from whatever sources they use and hand it over.

use crate::error::Result;
use crate::stream_type::StreamType;
use serde::Deserialize;

/// A procedure the host routes through the interceptor
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcedureConfig {
    /// `/<package.Service>/<Method>`
    pub path: String,
    #[serde(default = "unary")]
    pub stream_type: StreamType,
}

fn unary() -> StreamType {
    StreamType::Unary
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Latency bucket boundaries in seconds
    pub histogram_buckets: Vec<f64>,
    pub procedures: Vec<ProcedureConfig>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            procedures: Vec::new(),
        }
    }
}

impl MetricsConfig {
    /// Deserialize from an already assembled `config::Config`
    pub fn from_config(config: config::Config) -> Result<Self> {
        Ok(config.try_deserialize()?)
    }
}
