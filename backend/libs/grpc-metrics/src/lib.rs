//! gRPC Metrics - Prometheus instrumentation for RPC calls
//!
//! Wraps call execution and records, separately for the client and the
//! server side:
//! - Calls started, by service/method/type
//! - Calls handled, by service/method/type and outcome code
//! - Handling latency histograms
//!
//! The registry is an explicit value. Build it once at startup, build an
//! interceptor against it, and install the interceptor either around a call
//! executor (`wrap_unary` / `layer`) or around a tonic router or channel
//! (`http_layer`).
//!
//! Usage:
//! ```ignore
//! use grpc_metrics::{MetricsInterceptor, Registry, Role, StreamType};
//!
//! let registry = Registry::new();
//! let interceptor = MetricsInterceptor::builder(&registry)
//!     .procedure("/helloworld.Greeter/SayHello", StreamType::Unary)
//!     .build()?;
//!
//! Server::builder()
//!     .layer(interceptor.http_layer(Role::Server))
//!     .add_service(GreeterServer::new(greeter))
//!     .serve(addr)
//!     .await?;
//!
//! // Exposition
//! let body = registry.encode_text()?;
//! ```

pub mod call;
pub mod code;
pub mod config;
mod error;
pub mod interceptor;
pub mod layer;
pub mod metrics;
pub mod procedure;
pub mod registry;
pub mod stream_type;

pub use crate::config::{MetricsConfig, ProcedureConfig};
pub use call::{Call, CallMetadata, CallSpec, Role};
pub use code::{code_label, code_of_error, outcome_label, StatusCodeOf};
pub use error::{MetricsError, Result};
pub use interceptor::{InterceptorBuilder, MetricsInterceptor, MetricsLayer, MetricsService};
pub use layer::{GrpcMetricsLayer, GrpcMetricsService, MetricsBody};
pub use metrics::{CallLabels, GrpcMetrics};
pub use procedure::Procedure;
pub use registry::{
    CounterFamily, Family, FamilyOpts, HistogramFamily, HistogramSample, MetricKind, Registry,
};
pub use stream_type::StreamType;
