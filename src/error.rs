//! Error types for peerwire.

use thiserror::Error;

/// Failure reported by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed; nothing can be sent anymore.
    #[error("transport closed")]
    Closed,

    /// The underlying channel rejected the message.
    #[error("send failed: {0}")]
    Send(String),

    /// I/O error from a byte-stream backed transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a stream-based channel operation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport refused the outgoing message. The pending entry has
    /// already been removed, so the id is not leaked.
    #[error("transport send failed: {0}")]
    Send(#[from] TransportError),

    /// The transport closed before a response arrived.
    #[error("channel closed before a response arrived")]
    ChannelClosed,

    /// The peer answered with a response carrying neither result nor error.
    #[error("response carried neither result nor error")]
    ProtocolViolation,
}

/// Error observed by the caller of a typed request or notification.
///
/// `E` is the descriptor's error-data type; `Handler` carries the peer's
/// structured error after its `data` field ran through the descriptor's
/// error serializer.
#[derive(Debug, Error)]
pub enum CallError<E = serde_json::Value> {
    /// The peer's handler answered with a JSON-RPC error response.
    #[error("request failed with code {code}: {message}")]
    Handler {
        code: i64,
        message: String,
        data: Option<E>,
    },

    /// Serializing the outgoing args failed locally.
    #[error("failed to serialize {what}: {message}")]
    Serialize { what: &'static str, message: String },

    /// Deserializing the response result or error data failed locally.
    #[error("failed to deserialize {what}: {message}")]
    Deserialize { what: &'static str, message: String },

    /// Serialized params were a scalar; JSON-RPC requires object, array, or
    /// null.
    #[error("request params must serialize to an object, array, or null")]
    InvalidParamsShape,

    /// The descriptor has no method name bound.
    #[error("descriptor has no method name bound")]
    MissingMethodName,

    /// The typed channel has not been started yet.
    #[error("typed channel must be started before sending")]
    NotStarted,

    /// Failure from the underlying channel (send failure, close, protocol
    /// violation).
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl<E> CallError<E> {
    /// The JSON-RPC error code, for `Handler` errors.
    pub fn code(&self) -> Option<i64> {
        match self {
            CallError::Handler { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Failure while registering a handler on a typed channel.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A request handler already exists for the method.
    #[error("a request handler is already registered for method `{0}`")]
    DuplicateRequest(String),

    /// The method is registered with a different descriptor.
    #[error("method `{0}` is already registered with a conflicting descriptor")]
    ConflictingDescriptor(String),

    /// The method is registered as the other kind (request vs notification).
    #[error("method `{0}` is already registered as a different kind")]
    ConflictingKind(String),

    /// The descriptor has no method name bound.
    #[error("descriptor has no method name bound")]
    MissingMethodName,
}

/// Failure while starting a channel.
#[derive(Debug, Error)]
pub enum StartError {
    /// `start` was called a second time.
    #[error("typed channel already started")]
    AlreadyStarted,

    /// The factory was already materialized against its transport.
    #[error("stream channel factory already materialized")]
    AlreadyMaterialized,
}

/// Failure while instantiating a contract against a channel.
#[derive(Debug, Error)]
pub enum ContractError {
    /// A request descriptor on this role's side has no handler.
    #[error("contract `{contract}` requires a handler for request `{method}`")]
    MissingRequestHandler { contract: String, method: String },

    /// A handler was supplied for a method the contract does not declare.
    #[error("contract `{contract}` does not declare method `{method}`")]
    UnknownMethod { contract: String, method: String },

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Start(#[from] StartError),
}
