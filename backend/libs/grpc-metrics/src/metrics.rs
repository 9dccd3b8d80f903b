//! Prometheus metric families for gRPC calls
//!
//! Six families, client and server side each with a started counter, a
//! handled counter broken down by outcome, and a latency histogram. Names and
//! label keys match the ones existing dashboards and alerts query.

use crate::call::{CallMetadata, Role};
use crate::error::Result;
use crate::procedure::Procedure;
use crate::registry::{CounterFamily, HistogramFamily, Registry};
use crate::stream_type::StreamType;

pub const LABEL_CODE: &str = "grpc_code";
pub const LABEL_METHOD: &str = "method";
pub const LABEL_SERVICE: &str = "service";
pub const LABEL_TYPE: &str = "type";

pub const CLIENT_STARTED_TOTAL: &str = "grpc_client_started_total";
pub const CLIENT_HANDLED_TOTAL: &str = "grpc_client_handled_total";
pub const CLIENT_HANDLING_SECONDS: &str = "grpc_client_handling_seconds_bucket";
pub const SERVER_STARTED_TOTAL: &str = "grpc_server_started_total";
pub const SERVER_HANDLED_TOTAL: &str = "grpc_server_handled_total";
pub const SERVER_HANDLING_SECONDS: &str = "grpc_server_handling_seconds_bucket";

const CALL_LABELS: &[&str] = &[LABEL_METHOD, LABEL_SERVICE, LABEL_TYPE];
const HANDLED_LABELS: &[&str] = &[LABEL_CODE, LABEL_METHOD, LABEL_SERVICE, LABEL_TYPE];

/// Labels of a single call, derived once before the call runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLabels {
    role: Role,
    service: String,
    method: String,
    stream_type: StreamType,
}

impl CallLabels {
    /// Derive labels from call metadata
    ///
    /// ## Errors
    ///
    /// Returns `MetricsError::MalformedProcedure` if the procedure identifier
    /// is not `/<service>/<method>`.
    pub fn from_call<C: CallMetadata + ?Sized>(call: &C) -> Result<Self> {
        Self::new(call.role(), call.procedure(), call.stream_type())
    }

    pub fn new(role: Role, procedure: &str, stream_type: StreamType) -> Result<Self> {
        let procedure = Procedure::parse(procedure)?;
        Ok(Self {
            role,
            service: procedure.service().to_string(),
            method: procedure.method().to_string(),
            stream_type,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn values(&self) -> [&str; 3] {
        [
            self.method.as_str(),
            self.service.as_str(),
            self.stream_type.label(),
        ]
    }
}

#[derive(Clone)]
struct RoleMetrics {
    started: CounterFamily,
    handled: CounterFamily,
    duration: HistogramFamily,
}

/// The client and server metric families
#[derive(Clone)]
pub struct GrpcMetrics {
    client: RoleMetrics,
    server: RoleMetrics,
}

impl GrpcMetrics {
    /// Declare all six families in `registry`
    ///
    /// Declaring twice against the same registry with the same buckets returns
    /// handles to the same families.
    pub fn new(registry: &Registry, buckets: Vec<f64>) -> Result<Self> {
        let client = RoleMetrics {
            started: registry.declare_counter(
                CLIENT_STARTED_TOTAL,
                "Total number of RPCs started on the client.",
                CALL_LABELS,
            )?,
            handled: registry.declare_counter(
                CLIENT_HANDLED_TOTAL,
                "Total number of RPCs completed by the client, regardless of success or failure.",
                HANDLED_LABELS,
            )?,
            duration: registry.declare_histogram(
                CLIENT_HANDLING_SECONDS,
                "Histogram of response latency (seconds) of gRPC until it is finished by the application.",
                CALL_LABELS,
                buckets.clone(),
            )?,
        };

        let server = RoleMetrics {
            started: registry.declare_counter(
                SERVER_STARTED_TOTAL,
                "Total number of RPCs started on the server.",
                CALL_LABELS,
            )?,
            handled: registry.declare_counter(
                SERVER_HANDLED_TOTAL,
                "Total number of RPCs completed on the server, regardless of success or failure.",
                HANDLED_LABELS,
            )?,
            duration: registry.declare_histogram(
                SERVER_HANDLING_SECONDS,
                "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server.",
                CALL_LABELS,
                buckets,
            )?,
        };

        Ok(Self { client, server })
    }

    fn role(&self, role: Role) -> &RoleMetrics {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    /// Record that a call started
    pub fn record_started(&self, labels: &CallLabels) {
        self.role(labels.role).started.increment(&labels.values());
    }

    /// Record a completed call with its outcome label and duration
    pub fn record_handled(&self, labels: &CallLabels, code: &str, duration_secs: f64) {
        let metrics = self.role(labels.role);
        let [method, service, stream_type] = labels.values();

        metrics
            .duration
            .observe(&[method, service, stream_type], duration_secs);
        metrics
            .handled
            .increment(&[code, method, service, stream_type]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets() -> Vec<f64> {
        prometheus::DEFAULT_BUCKETS.to_vec()
    }

    fn greeter(role: Role) -> CallLabels {
        let labels = CallLabels::new(role, "/helloworld.Greeter/SayHello", StreamType::Unary);
        labels.unwrap()
    }

    fn call_labels() -> [(&'static str, &'static str); 3] {
        [
            (LABEL_METHOD, "SayHello"),
            (LABEL_SERVICE, "helloworld.Greeter"),
            (LABEL_TYPE, "unary"),
        ]
    }

    #[test]
    fn test_metrics_creation() {
        let registry = Registry::new();
        assert!(GrpcMetrics::new(&registry, buckets()).is_ok());
        // Same shape again is a no-op
        assert!(GrpcMetrics::new(&registry, buckets()).is_ok());
        // Different buckets conflict
        assert!(GrpcMetrics::new(&registry, vec![0.1, 1.0]).is_err());
    }

    #[test]
    fn test_record_server_call() {
        let registry = Registry::new();
        let metrics = GrpcMetrics::new(&registry, buckets()).unwrap();
        let labels = greeter(Role::Server);

        metrics.record_started(&labels);
        metrics.record_handled(&labels, "ok", 0.012);

        let started = registry.counter_value(SERVER_STARTED_TOTAL, &call_labels());
        assert_eq!(started, Some(1));

        let mut handled = call_labels().to_vec();
        handled.push((LABEL_CODE, "ok"));
        let handled = registry.counter_value(SERVER_HANDLED_TOTAL, &handled);
        assert_eq!(handled, Some(1));

        let sample = registry
            .histogram_sample(SERVER_HANDLING_SECONDS, &call_labels())
            .unwrap();
        assert_eq!(sample.count, 1);

        let client = registry.counter_value(CLIENT_STARTED_TOTAL, &call_labels());
        assert_eq!(client, None);
    }

    #[test]
    fn test_client_started_is_recorded() {
        let registry = Registry::new();
        let metrics = GrpcMetrics::new(&registry, buckets()).unwrap();

        metrics.record_started(&greeter(Role::Client));

        let client = registry.counter_value(CLIENT_STARTED_TOTAL, &call_labels());
        let server = registry.counter_value(SERVER_STARTED_TOTAL, &call_labels());
        assert_eq!(client, Some(1));
        assert_eq!(server, None);
    }

    #[test]
    fn test_call_labels_reject_malformed_procedure() {
        let labels = CallLabels::new(Role::Server, "/bad", StreamType::Unary);
        assert!(labels.is_err());
    }
}
