//! Call metadata capability
//!
//! The interceptor never looks at a runtime's concrete call object. It only
//! needs the procedure identifier, which side of the call it runs on and the
//! call shape, so anything that can report those three can be instrumented.

use crate::stream_type::StreamType;
use std::borrow::Cow;

/// Which side of the call the interceptor is observing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Static metadata the interceptor derives labels from
pub trait CallMetadata {
    /// Full procedure identifier, `/<package.Service>/<Method>`
    fn procedure(&self) -> &str;

    fn role(&self) -> Role;

    fn stream_type(&self) -> StreamType;

    fn is_client(&self) -> bool {
        self.role() == Role::Client
    }
}

/// Owned call metadata for runtimes that hand it over separately from the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    procedure: Cow<'static, str>,
    role: Role,
    stream_type: StreamType,
}

impl CallSpec {
    pub fn new(
        procedure: impl Into<Cow<'static, str>>,
        role: Role,
        stream_type: StreamType,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            role,
            stream_type,
        }
    }

    pub fn client(procedure: impl Into<Cow<'static, str>>, stream_type: StreamType) -> Self {
        Self::new(procedure, Role::Client, stream_type)
    }

    pub fn server(procedure: impl Into<Cow<'static, str>>, stream_type: StreamType) -> Self {
        Self::new(procedure, Role::Server, stream_type)
    }
}

impl CallMetadata for CallSpec {
    fn procedure(&self) -> &str {
        &self.procedure
    }

    fn role(&self) -> Role {
        self.role
    }

    fn stream_type(&self) -> StreamType {
        self.stream_type
    }
}

/// A call payload together with its metadata
#[derive(Debug, Clone)]
pub struct Call<T> {
    spec: CallSpec,
    message: T,
}

impl<T> Call<T> {
    pub fn new(spec: CallSpec, message: T) -> Self {
        Self { spec, message }
    }

    pub fn spec(&self) -> &CallSpec {
        &self.spec
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }
}

impl<T> CallMetadata for Call<T> {
    fn procedure(&self) -> &str {
        self.spec.procedure()
    }

    fn role(&self) -> Role {
        self.spec.role()
    }

    fn stream_type(&self) -> StreamType {
        self.spec.stream_type()
    }
}
