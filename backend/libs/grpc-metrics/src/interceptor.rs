//! Unary call interceptor
//!
//! `MetricsInterceptor` wraps a call executor (any `tower::Service` whose
//! request reports `CallMetadata`) and records, per call:
//!
//! 1. `grpc_{client,server}_started_total` before the call runs
//! 2. `grpc_{client,server}_handling_seconds_bucket` with the elapsed time
//! 3. `grpc_{client,server}_handled_total` with the outcome code
//!
//! The wrapped call's response and error pass through untouched. A call whose
//! procedure identifier is malformed never reaches the wrapped service and
//! records nothing; the caller gets `Status::internal` instead.
//!
//! Streaming shapes are not instrumented. Building an interceptor for a
//! runtime that routes streaming procedures through it fails with
//! `MetricsError::UnsupportedStreamType`, and a streaming call that still
//! reaches the wrapper is rejected the same way as a malformed one.

use crate::call::{CallMetadata, Role};
use crate::code::{code_label, outcome_label, StatusCodeOf};
use crate::config::{MetricsConfig, ProcedureConfig};
use crate::error::{MetricsError, Result};
use crate::layer::GrpcMetricsLayer;
use crate::metrics::{CallLabels, GrpcMetrics};
use crate::procedure::Procedure;
use crate::registry::Registry;
use crate::stream_type::StreamType;
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Records the outcome of one call exactly once
///
/// Created after the started counter is incremented. If it is dropped before
/// `complete` runs (the caller abandoned the call), the call is recorded as
/// `canceled` so started and handled counts stay balanced.
pub(crate) struct HandledGuard {
    metrics: Arc<GrpcMetrics>,
    labels: CallLabels,
    start: Instant,
    completed: bool,
}

impl HandledGuard {
    pub(crate) fn complete(mut self, code: &str) {
        self.record(code);
    }

    fn record(&mut self, code: &str) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.metrics
            .record_handled(&self.labels, code, self.start.elapsed().as_secs_f64());
    }
}

impl Drop for HandledGuard {
    fn drop(&mut self) {
        if !self.completed {
            debug!(
                service = self.labels.service(),
                method = self.labels.method(),
                "call dropped before completion"
            );
            self.record(code_label(Code::Cancelled));
        }
    }
}

/// Builder for `MetricsInterceptor`
pub struct InterceptorBuilder<'a> {
    registry: &'a Registry,
    buckets: Vec<f64>,
    procedures: HashMap<String, StreamType>,
    required: Vec<StreamType>,
}

impl<'a> InterceptorBuilder<'a> {
    fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            procedures: HashMap::new(),
            required: Vec::new(),
        }
    }

    /// Latency bucket boundaries for both duration histograms
    pub fn histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Declare a procedure the runtime will route through this interceptor
    pub fn procedure(mut self, procedure: impl Into<String>, stream_type: StreamType) -> Self {
        self.procedures.insert(procedure.into(), stream_type);
        self
    }

    /// Declare a call shape the runtime requires the interceptor to handle
    pub fn require_stream_type(mut self, stream_type: StreamType) -> Self {
        self.required.push(stream_type);
        self
    }

    /// Apply buckets and procedures from configuration
    pub fn config(mut self, config: &MetricsConfig) -> Self {
        self.buckets = config.histogram_buckets.clone();
        for ProcedureConfig { path, stream_type } in &config.procedures {
            self.procedures.insert(path.clone(), *stream_type);
        }
        self
    }

    /// Declare the metric families and build the interceptor
    ///
    /// ## Errors
    ///
    /// - `UnsupportedStreamType` if a declared procedure or required shape streams
    /// - `MalformedProcedure` if a declared procedure is not `/<service>/<method>`
    /// - `ConflictingDeclaration` / `Prometheus` if the families cannot be declared
    pub fn build(self) -> Result<MetricsInterceptor> {
        for (procedure, stream_type) in &self.procedures {
            Procedure::parse(procedure)?;
            if stream_type.is_streaming() {
                return Err(MetricsError::UnsupportedStreamType {
                    stream_type: *stream_type,
                });
            }
        }
        if let Some(stream_type) = self.required.iter().find(|s| s.is_streaming()) {
            return Err(MetricsError::UnsupportedStreamType {
                stream_type: *stream_type,
            });
        }

        let metrics = GrpcMetrics::new(self.registry, self.buckets)?;

        debug!(
            procedures = self.procedures.len(),
            "grpc metrics interceptor ready"
        );

        Ok(MetricsInterceptor {
            metrics: Arc::new(metrics),
            procedures: Arc::new(self.procedures),
        })
    }
}

/// Observes unary calls and records them into the registry it was built with
#[derive(Clone)]
pub struct MetricsInterceptor {
    metrics: Arc<GrpcMetrics>,
    procedures: Arc<HashMap<String, StreamType>>,
}

impl MetricsInterceptor {
    /// Interceptor with default buckets and no procedure table
    pub fn new(registry: &Registry) -> Result<Self> {
        Self::builder(registry).build()
    }

    pub fn builder(registry: &Registry) -> InterceptorBuilder<'_> {
        InterceptorBuilder::new(registry)
    }

    /// Wrap a unary call executor
    pub fn wrap_unary<S>(&self, next: S) -> MetricsService<S> {
        MetricsService {
            inner: next,
            interceptor: self.clone(),
        }
    }

    /// Tower layer form of `wrap_unary`
    pub fn layer(&self) -> MetricsLayer {
        MetricsLayer {
            interceptor: self.clone(),
        }
    }

    /// Layer for `http::Request`/`http::Response` services such as a tonic
    /// server router (`Role::Server`) or client channel (`Role::Client`)
    pub fn http_layer(&self, role: Role) -> GrpcMetricsLayer {
        GrpcMetricsLayer::new(self.clone(), role)
    }

    /// Shape of a declared procedure, `Unspecified` if unknown
    pub fn stream_type_of(&self, procedure: &str) -> StreamType {
        self.procedures
            .get(procedure)
            .copied()
            .unwrap_or_default()
    }

    /// Record the start of a call and hand back its completion guard
    pub(crate) fn begin(&self, labels: CallLabels, start: Instant) -> HandledGuard {
        self.metrics.record_started(&labels);
        HandledGuard {
            metrics: self.metrics.clone(),
            labels,
            start,
            completed: false,
        }
    }
}

/// Tower layer producing `MetricsService`
#[derive(Clone)]
pub struct MetricsLayer {
    interceptor: MetricsInterceptor,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        self.interceptor.wrap_unary(service)
    }
}

/// A call executor wrapped with metric bookkeeping
#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    interceptor: MetricsInterceptor,
}

impl<S> MetricsService<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, Req> Service<Req> for MetricsService<S>
where
    Req: CallMetadata,
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Error: From<Status> + StatusCodeOf + Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let start = Instant::now();

        let stream_type = req.stream_type();
        let labels = if stream_type.is_streaming() {
            Err(MetricsError::UnsupportedStreamType { stream_type })
        } else {
            CallLabels::from_call(&req)
        };
        let labels = match labels {
            Ok(labels) => labels,
            Err(err) => {
                warn!(procedure = req.procedure(), "rejecting call: {}", err);
                return future::ready(Err(S::Error::from(Status::from(err)))).boxed();
            }
        };

        let guard = self.interceptor.begin(labels, start);
        let response = self.inner.call(req);

        async move {
            let result = response.await;
            guard.complete(outcome_label(result.as_ref().err()));
            result
        }
        .boxed()
    }
}
