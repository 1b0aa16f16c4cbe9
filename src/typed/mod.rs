//! Typed channel: schema-driven dispatch over a request/response channel.
//!
//! The typed layer owns a method-dispatch table, turns inbound messages
//! into typed handler invocations, and turns outgoing typed calls into
//! correlated channel requests. Serializer failures map onto JSON-RPC
//! error codes; handler failures are classified into domain errors,
//! forwarded response errors, and unexpected errors.
//!
//! Entry points:
//!
//! - [`TypedChannel`] - the stock implementation over a
//!   [`crate::channel::StreamBasedChannel`]
//! - [`TypedRpc`] - the trait the contract runtime works against
//! - [`MappedChannel`] - re-types the receive/send contexts with async
//!   conversion functions

mod channel;
mod mapped;

pub use channel::{TypedChannel, TypedChannelOptions};
pub use mapped::MappedChannel;

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{CallError, RegistrationError};
use crate::message::RequestId;
use crate::types::{MethodKind, MethodTypeInfo, NotificationType, RequestType};

/// Boxed future used by type-erased handler storage.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Reserved marker property propagating the lenient-deserialization hint
/// to the peer. Stripped from inbound params before deserialization;
/// peers that do not understand it ignore it.
pub const IGNORE_UNEXPECTED_PROPERTIES_MARKER: &str = "$ignoreUnexpectedProperties";

/// Per-invocation data handed to a request handler.
#[derive(Debug, Clone)]
pub struct RequestContext<C> {
    /// Id of the request being handled.
    pub request_id: RequestId,
    /// The channel's receive context.
    pub context: C,
}

/// A deliberate, wire-visible error returned by a handler.
///
/// The descriptor's error serializer carries `data` to the peer; omitted
/// fields fall back to [`crate::message::codes::GENERIC_APPLICATION_ERROR`]
/// and a stock message.
#[derive(Debug, Clone)]
pub struct DomainError<E> {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub data: Option<E>,
}

impl<E> DomainError<E> {
    pub fn new() -> Self {
        Self {
            code: None,
            message: None,
            data: None,
        }
    }

    /// Domain error with just a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: E) -> Self {
        self.data = Some(data);
        self
    }
}

impl<E> Default for DomainError<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// How a request handler failed.
#[derive(Debug)]
pub enum HandlerError<E> {
    /// A deliberate domain error; serialized through the descriptor's
    /// error serializer with the handler's chosen code and message.
    Domain(DomainError<E>),
    /// A pre-shaped JSON-RPC error; code, message, and data are forwarded
    /// verbatim.
    Response(crate::message::ErrorObject),
    /// Anything else. Logged locally; the peer sees a generic
    /// unexpected-server-error unless `send_exception_details` is set.
    Unexpected(Box<dyn std::error::Error + Send + Sync>),
}

impl<E> From<DomainError<E>> for HandlerError<E> {
    fn from(err: DomainError<E>) -> Self {
        HandlerError::Domain(err)
    }
}

/// What a typed request handler returns.
pub type RequestHandlerResult<R, E> = Result<R, HandlerError<E>>;

/// What a typed notification handler returns. Failures are logged and
/// dropped, never answered.
pub type NotificationResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// One row of the dispatch table, as reported to reflection.
#[derive(Debug, Clone)]
pub struct RegisteredMethod {
    pub kind: MethodKind,
    pub method: String,
    pub types: MethodTypeInfo,
}

/// Fired whenever a typed request surfaces an error to its caller.
#[derive(Debug, Clone)]
pub struct RequestDidErrorEvent {
    pub method: String,
    /// JSON-RPC code for error responses, `None` for local failures.
    pub code: Option<i64>,
    pub message: String,
}

/// Undoes one registration. Idempotent: disposing twice is a no-op.
pub struct Registration {
    dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").finish_non_exhaustive()
    }
}

impl Registration {
    pub(crate) fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// Remove the registration. Subsequent calls do nothing.
    pub fn dispose(&self) {
        let dispose = self.dispose.lock().unwrap().take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose.lock().unwrap().is_none()
    }
}

/// Aggregate disposer over many registrations.
#[derive(Default, Debug)]
pub struct Registrations {
    items: Mutex<Vec<Registration>>,
}

impl Registrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, registration: Registration) {
        self.items.lock().unwrap().push(registration);
    }

    /// Dispose everything collected so far. Idempotent.
    pub fn dispose(&self) {
        let drained: Vec<Registration> = self.items.lock().unwrap().drain(..).collect();
        for registration in drained {
            registration.dispose();
        }
    }
}

/// The typed request/notification surface the contract runtime binds to.
///
/// `C` is the receive context handed to handlers, `S` the send context
/// accepted by requests and notifications. [`TypedChannel`] implements it
/// directly; [`MappedChannel`] implements it by translating contexts.
pub trait TypedRpc<C, S>: Send + Sync
where
    C: Send + 'static,
    S: Send + 'static,
{
    /// Register the single request handler for a method.
    fn register_request<P, R, E, F, Fut>(
        &self,
        descriptor: &RequestType<P, R, E>,
        handler: F,
    ) -> Result<Registration, RegistrationError>
    where
        P: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(P, RequestContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestHandlerResult<R, E>> + Send + 'static;

    /// Add a notification handler. Re-registering the same descriptor
    /// adds to the handler set.
    fn register_notification<P, F, Fut>(
        &self,
        descriptor: &NotificationType<P>,
        handler: F,
    ) -> Result<Registration, RegistrationError>
    where
        P: Send + 'static,
        F: Fn(P, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NotificationResult> + Send + 'static;

    /// Send a typed request with an explicit send context.
    fn request_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        context: S,
    ) -> BoxFuture<Result<R, CallError<E>>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static;

    /// Like [`TypedRpc::request_with`], but `METHOD_NOT_FOUND` resolves to
    /// `Ok(None)` instead of an error.
    fn request_optional_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        context: S,
    ) -> BoxFuture<Result<Option<R>, CallError<E>>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static;

    /// Send a typed notification with an explicit send context.
    fn notify_with<P>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
        context: S,
    ) -> BoxFuture<Result<(), CallError<()>>>
    where
        P: Send + Sync + 'static;

    /// Snapshot of the dispatch table, consumed by reflection.
    fn registered_methods(&self) -> Vec<RegisteredMethod>;
}

/// Raw JSON value of an unknown notification, handed to the channel's
/// unknown-notification handlers.
#[derive(Debug, Clone)]
pub struct UnknownNotification {
    pub method: String,
    pub params: Option<Value>,
}
