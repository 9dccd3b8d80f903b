//! Outcome classification
//!
//! Maps the terminal error of a call to the `grpc_code` label. The mapping is
//! total: anything that does not carry a recognizable status is `unknown`.

use crate::error::MetricsError;
use http::HeaderMap;
use std::error::Error;
use tonic::{Code, Status};

/// Label recorded for calls that completed without an error
pub const OK_LABEL: &str = "ok";

const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Errors that can report the gRPC status code they carry
pub trait StatusCodeOf {
    fn status_code(&self) -> Code;
}

impl StatusCodeOf for Status {
    fn status_code(&self) -> Code {
        self.code()
    }
}

impl StatusCodeOf for MetricsError {
    fn status_code(&self) -> Code {
        Code::Internal
    }
}

impl StatusCodeOf for Box<dyn Error + Send + Sync> {
    fn status_code(&self) -> Code {
        code_of_error(&**self)
    }
}

/// Walk an error's source chain looking for a `tonic::Status`
pub fn code_of_error(err: &(dyn Error + 'static)) -> Code {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(status) = err.downcast_ref::<Status>() {
            return status.code();
        }
        current = err.source();
    }
    Code::Unknown
}

/// Canonical snake_case name for a status code
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => OK_LABEL,
        Code::Cancelled => "canceled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

/// Label for a call outcome: `ok` without an error, the code name otherwise
pub fn outcome_label<E: StatusCodeOf + ?Sized>(err: Option<&E>) -> &'static str {
    match err {
        None => OK_LABEL,
        Some(err) => code_label(err.status_code()),
    }
}

/// Read the numeric `grpc-status` entry from response headers or trailers
pub fn code_from_headers(headers: &HeaderMap) -> Option<Code> {
    let value = headers.get(GRPC_STATUS_HEADER)?;
    let code = value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .map_or(Code::Unknown, Code::from_i32);
    Some(code)
}
