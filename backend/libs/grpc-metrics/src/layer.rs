//! HTTP-level metrics layer
//!
//! Adapts the interceptor to `http::Request`/`http::Response` services, which
//! is what a tonic server router and a tonic client channel are. The
//! procedure comes from the URI path and the shape from the interceptor's
//! procedure table.
//!
//! gRPC reports the outcome in the `grpc-status` trailer (or in the response
//! headers for trailers-only responses), so the response body is wrapped and
//! the call is recorded once the status is seen. Duration covers the whole
//! response body.

use crate::call::Role;
use crate::code::{code_from_headers, code_label, code_of_error};
use crate::interceptor::{HandledGuard, MetricsInterceptor};
use crate::metrics::CallLabels;
use futures::future::{self, BoxFuture, FutureExt};
use futures::ready;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::warn;

const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Tower layer recording gRPC metrics around an HTTP service
#[derive(Clone)]
pub struct GrpcMetricsLayer {
    interceptor: MetricsInterceptor,
    role: Role,
}

impl GrpcMetricsLayer {
    pub fn new(interceptor: MetricsInterceptor, role: Role) -> Self {
        Self { interceptor, role }
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        GrpcMetricsService {
            inner: service,
            interceptor: self.interceptor.clone(),
            role: self.role,
        }
    }
}

/// Tower service produced by `GrpcMetricsLayer`
#[derive(Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
    interceptor: MetricsInterceptor,
    role: Role,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    ResBody: Body + Send + 'static,
{
    type Response = Response<MetricsBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let start = Instant::now();
        let procedure = req.uri().path();
        let stream_type = self.interceptor.stream_type_of(procedure);

        let labels = match CallLabels::new(self.role, procedure, stream_type) {
            Ok(labels) => labels,
            Err(err) => {
                warn!(procedure, "rejecting call: {}", err);
                let response = rejected_response(Status::from(err));
                return future::ready(Ok(response)).boxed();
            }
        };

        let guard = self.interceptor.begin(labels, start);
        let response = self.inner.call(req);

        async move {
            match response.await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let guard = match code_from_headers(&parts.headers) {
                        Some(code) => {
                            guard.complete(code_label(code));
                            None
                        }
                        None => Some(guard),
                    };
                    let body = MetricsBody::observed(body, guard);
                    Ok(Response::from_parts(parts, body))
                }
                Err(err) => {
                    guard.complete(code_label(code_of_error(&err)));
                    Err(err)
                }
            }
        }
        .boxed()
    }
}

/// Trailers-only response carrying `status`, sent without calling the inner service
fn rejected_response<B>(status: Status) -> Response<MetricsBody<B>> {
    let mut response = Response::new(MetricsBody::rejected());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    if let Err(err) = status.add_header(response.headers_mut()) {
        warn!("failed to encode rejection status: {}", err);
    }
    response
}

/// Response body that completes the call's metrics when the status arrives
#[pin_project]
pub struct MetricsBody<B> {
    #[pin]
    state: BodyState<B>,
}

#[pin_project(project = BodyStateProj)]
enum BodyState<B> {
    Observed {
        #[pin]
        inner: B,
        guard: Option<HandledGuard>,
    },
    Rejected,
}

impl<B> MetricsBody<B> {
    fn observed(inner: B, guard: Option<HandledGuard>) -> Self {
        Self {
            state: BodyState::Observed { inner, guard },
        }
    }

    fn rejected() -> Self {
        Self {
            state: BodyState::Rejected,
        }
    }
}

impl<B> std::fmt::Debug for MetricsBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsBody").finish_non_exhaustive()
    }
}

impl<B> Body for MetricsBody<B>
where
    B: Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let (inner, guard) = match self.project().state.project() {
            BodyStateProj::Observed { inner, guard } => (inner, guard),
            BodyStateProj::Rejected => return Poll::Ready(None),
        };

        let frame = ready!(inner.poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(code) = frame.trailers_ref().and_then(code_from_headers) {
                    if let Some(guard) = guard.take() {
                        guard.complete(code_label(code));
                    }
                }
            }
            // Ended or failed without reporting a status
            Some(Err(_)) | None => {
                if let Some(guard) = guard.take() {
                    guard.complete(code_label(Code::Unknown));
                }
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        match &self.state {
            BodyState::Observed { inner, .. } => inner.is_end_stream(),
            BodyState::Rejected => true,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.state {
            BodyState::Observed { inner, .. } => inner.size_hint(),
            BodyState::Rejected => SizeHint::with_exact(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{LABEL_CODE, SERVER_HANDLED_TOTAL, SERVER_STARTED_TOTAL};
    use crate::registry::Registry;
    use crate::stream_type::StreamType;
    use http::HeaderMap;
    use http_body_util::BodyExt;
    use std::convert::Infallible;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tower::{service_fn, ServiceExt};

    /// Body yielding a single trailers frame
    struct TrailersBody {
        trailers: Option<HeaderMap>,
    }

    impl TrailersBody {
        fn with_status(code: Code) -> Self {
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", HeaderValue::from(i32::from(code)));
            Self {
                trailers: Some(trailers),
            }
        }
    }

    impl Body for TrailersBody {
        type Data = &'static [u8];
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(self.trailers.take().map(|t| Ok(Frame::trailers(t))))
        }

        fn is_end_stream(&self) -> bool {
            self.trailers.is_none()
        }
    }

    /// Body that ends without any frame
    struct EmptyBody;

    impl Body for EmptyBody {
        type Data = &'static [u8];
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(None)
        }
    }

    /// Body whose first frame is an error
    struct FailingBody;

    impl Body for FailingBody {
        type Data = &'static [u8];
        type Error = io::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            let err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
            Poll::Ready(Some(Err(err)))
        }
    }

    fn interceptor(registry: &Registry) -> MetricsInterceptor {
        MetricsInterceptor::builder(registry)
            .procedure("/helloworld.Greeter/SayHello", StreamType::Unary)
            .build()
            .unwrap()
    }

    fn greeter_labels(code: Option<&'static str>) -> Vec<(&'static str, &'static str)> {
        let mut labels = vec![
            ("method", "SayHello"),
            ("service", "helloworld.Greeter"),
            ("type", "unary"),
        ];
        if let Some(code) = code {
            labels.push((LABEL_CODE, code));
        }
        labels
    }

    fn handled(registry: &Registry, code: &'static str) -> Option<u64> {
        registry.counter_value(SERVER_HANDLED_TOTAL, &greeter_labels(Some(code)))
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_status_from_trailers() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(TrailersBody::with_status(Code::NotFound)))
            }));

        let response = service
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap();

        assert_eq!(
            registry.counter_value(SERVER_STARTED_TOTAL, &greeter_labels(None)),
            Some(1)
        );
        // Not handled until the body finishes
        assert_eq!(handled(&registry, "not_found"), None);

        let collected = response.into_body().collect().await.unwrap();
        assert!(collected.trailers().is_some());

        assert_eq!(handled(&registry, "not_found"), Some(1));
    }

    #[tokio::test]
    async fn test_status_from_trailers_only_headers() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                let mut response = Response::new(TrailersBody::with_status(Code::Ok));
                response.headers_mut().insert(
                    "grpc-status",
                    HeaderValue::from(i32::from(Code::Unauthenticated)),
                );
                Ok::<_, Infallible>(response)
            }));

        let _response = service
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap();

        assert_eq!(handled(&registry, "unauthenticated"), Some(1));
    }

    #[tokio::test]
    async fn test_body_ending_without_status_is_unknown() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(EmptyBody))
            }));

        let response = service
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap();
        let collected = response.into_body().collect().await.unwrap();
        assert!(collected.trailers().is_none());

        assert_eq!(handled(&registry, "unknown"), Some(1));
        assert_eq!(handled(&registry, "canceled"), None);
    }

    #[tokio::test]
    async fn test_body_error_is_unknown() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(FailingBody))
            }));

        let response = service
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap();
        let err = response.into_body().collect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        assert_eq!(handled(&registry, "unknown"), Some(1));
        assert_eq!(handled(&registry, "canceled"), None);
    }

    #[tokio::test]
    async fn test_inner_service_error_classified() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                Err::<Response<EmptyBody>, _>(Status::unavailable("backend down"))
            }));

        let status = service
            .clone()
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(handled(&registry, "unavailable"), Some(1));

        let transport = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                let err = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
                Err::<Response<EmptyBody>, _>(err)
            }));

        transport
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap_err();
        assert_eq!(handled(&registry, "unknown"), Some(1));
    }

    #[tokio::test]
    async fn test_dropped_body_recorded_as_canceled() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(TrailersBody::with_status(Code::Ok)))
            }));

        let response = service
            .oneshot(request("/helloworld.Greeter/SayHello"))
            .await
            .unwrap();
        drop(response);

        assert_eq!(handled(&registry, "canceled"), Some(1));
    }

    #[tokio::test]
    async fn test_malformed_path_rejected_without_calling_inner() {
        let registry = Registry::new();
        let called = Arc::new(AtomicBool::new(false));
        let inner_called = called.clone();
        let service = interceptor(&registry)
            .http_layer(Role::Server)
            .layer(service_fn(move |_req: Request<()>| {
                inner_called.store(true, Ordering::SeqCst);
                async { Ok::<_, Infallible>(Response::new(TrailersBody::with_status(Code::Ok))) }
            }));

        let response = service.oneshot(request("/bad")).await.unwrap();

        assert!(!called.load(Ordering::SeqCst));

        assert_eq!(code_from_headers(response.headers()), Some(Code::Internal));
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            GRPC_CONTENT_TYPE
        );
        assert!(response.body().is_end_stream());
        assert!(registry.gather().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_procedure_has_empty_type_label() {
        let registry = Registry::new();
        let service = interceptor(&registry)
            .http_layer(Role::Client)
            .layer(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(TrailersBody::with_status(Code::Ok)))
            }));

        let response = service
            .oneshot(request("/helloworld.Greeter/SayGoodbye"))
            .await
            .unwrap();
        response.into_body().collect().await.unwrap();

        let labels = [
            ("grpc_code", "ok"),
            ("method", "SayGoodbye"),
            ("service", "helloworld.Greeter"),
            ("type", ""),
        ];
        assert_eq!(
            registry.counter_value(crate::metrics::CLIENT_HANDLED_TOTAL, &labels),
            Some(1)
        );
    }
}
