//! Procedure identifier parsing
//!
//! gRPC procedures travel as `/<package.Service>/<Method>`. Labels are taken
//! from the two segments; anything else is refused rather than guessed.

use crate::error::{MetricsError, Result};

/// A parsed procedure identifier borrowing from the raw path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure<'a> {
    service: &'a str,
    method: &'a str,
}

impl<'a> Procedure<'a> {
    /// Split `/<service>/<method>` into its two segments
    ///
    /// ## Errors
    ///
    /// Returns `MetricsError::MalformedProcedure` unless splitting on `/`
    /// yields exactly an empty prefix followed by a non-empty service and a
    /// non-empty method.
    pub fn parse(procedure: &'a str) -> Result<Self> {
        let mut segments = procedure.split('/');
        match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(""), Some(service), Some(method), None)
                if !service.is_empty() && !method.is_empty() =>
            {
                Ok(Self { service, method })
            }
            _ => Err(MetricsError::malformed_procedure(procedure)),
        }
    }

    pub fn service(&self) -> &'a str {
        self.service
    }

    pub fn method(&self) -> &'a str {
        self.method
    }
}
