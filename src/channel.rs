//! Stream-based channel: request/response multiplexing over a transport.
//!
//! [`StreamBasedChannel`] turns a [`MessageTransport`] into a multiplexor:
//! it allocates request ids, correlates responses back to their callers,
//! and dispatches inbound requests and notifications to a single installed
//! [`ChannelHandler`]. Many requests may be outstanding at once; the
//! pending table is keyed by the id's string form so numeric and string
//! ids from different peers still correlate.
//!
//! The channel exclusively owns its transport. [`StreamChannelFactory`]
//! defers handler installation (the typed channel starts listening only
//! when explicitly started) and can be materialized exactly once.
//!
//! # Example
//!
//! ```ignore
//! let channel = StreamBasedChannel::new(transport, Some(handler));
//! let response = channel.request("calculate", Some(json!({"name": "foo"}))).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ChannelError, StartError};
use crate::logger::{default_logger, LogEntry, RpcLogger};
use crate::message::{
    codes, ErrorObject, Message, NotificationMessage, RequestId, RequestMessage, ResponseMessage,
};
use crate::transport::{ConnectionState, MessageTransport};

/// The two valid payloads of a received response.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelResponse {
    /// The peer answered with `result`.
    Result(Value),
    /// The peer answered with `error`.
    Error(ErrorObject),
}

/// Handler for inbound requests and notifications.
///
/// A stream-based channel has at most one; the typed channel installs its
/// dispatcher here. Request handlers answer with a result value or an
/// error object - the channel frames and sends the response.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        id: &RequestId,
    ) -> Result<Value, ErrorObject>;

    async fn handle_notification(&self, method: &str, params: Option<Value>);
}

/// A request/response channel, as consumed by the typed layer.
///
/// [`StreamBasedChannel`] is the stock implementation; anything with the
/// same correlation semantics can stand in.
#[async_trait]
pub trait RequestChannel: Send + Sync + 'static {
    /// Send a request and wait for the peer's response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ChannelResponse, ChannelError>;

    /// Send a notification; resolves when the transport accepts it.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError>;

    /// The transport's connection state, re-exported unchanged.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Creates the channel a typed channel listens on, once.
pub trait ChannelFactory: Send + Sync + 'static {
    /// Materialize the channel with the given handler installed. Fails
    /// fast on the second attempt.
    fn materialize(
        &self,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<dyn RequestChannel>, StartError>;
}

type PendingSender = oneshot::Sender<Result<ChannelResponse, ChannelError>>;

/// Pending table plus the id counter. Allocation and insertion happen
/// under one lock so two concurrent requests can never share an id.
struct PendingTable {
    next_id: u64,
    entries: HashMap<String, PendingSender>,
}

struct ChannelInner {
    transport: Box<dyn MessageTransport>,
    handler: Option<Arc<dyn ChannelHandler>>,
    pending: Mutex<PendingTable>,
    /// Feeds the per-channel worker that handles notifications in
    /// arrival order.
    notification_tx: mpsc::UnboundedSender<NotificationMessage>,
    logger: Arc<dyn RpcLogger>,
}

/// Request/response multiplexor over a single transport.
///
/// Cheap to clone; all clones share the same pending table and transport.
#[derive(Clone)]
pub struct StreamBasedChannel {
    inner: Arc<ChannelInner>,
}

impl StreamBasedChannel {
    /// Create a channel over `transport`, optionally with a handler for
    /// inbound requests and notifications.
    ///
    /// The listener is installed immediately, so any messages the
    /// transport buffered are dispatched before this returns. Without a
    /// handler, inbound requests are answered with `METHOD_NOT_FOUND`.
    pub fn new(
        transport: Box<dyn MessageTransport>,
        handler: Option<Arc<dyn ChannelHandler>>,
    ) -> Self {
        Self::with_logger(transport, handler, default_logger())
    }

    /// Like [`StreamBasedChannel::new`] with an explicit logger.
    pub fn with_logger(
        transport: Box<dyn MessageTransport>,
        handler: Option<Arc<dyn ChannelHandler>>,
        logger: Arc<dyn RpcLogger>,
    ) -> Self {
        let mut state_rx = transport.connection_state();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            transport,
            handler,
            pending: Mutex::new(PendingTable {
                next_id: 0,
                entries: HashMap::new(),
            }),
            notification_tx,
            logger,
        });

        // Notifications are handled one at a time, in arrival order. The
        // worker ends when the channel is dropped (sender closes).
        let weak: Weak<ChannelInner> = Arc::downgrade(&inner);
        tokio::spawn(notification_worker(weak, notification_rx));

        // Fail outstanding requests when the transport closes. Holding a
        // weak reference lets the task end once the channel is gone.
        let weak: Weak<ChannelInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                if state_rx.borrow().is_closed() {
                    if let Some(inner) = weak.upgrade() {
                        inner.fail_pending();
                    }
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.set_listener(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(message);
            }
        }));

        Self { inner }
    }

    /// Send a request and wait for the matching response.
    ///
    /// Allocates a fresh id, records the pending entry, and sends. A send
    /// failure removes the entry before propagating, so the id is not
    /// leaked. Transport close fails the returned future.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ChannelResponse, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.inner.pending.lock().unwrap();
            let id = RequestId::Number(pending.next_id);
            pending.next_id += 1;
            pending.entries.insert(id.key(), tx);
            id
        };

        let message = Message::request(method, params, id.clone());
        if let Err(err) = self.inner.transport.send(message).await {
            self.inner.pending.lock().unwrap().entries.remove(&id.key());
            return Err(ChannelError::Send(err));
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Sender dropped: the pending table was drained on close.
            Err(_) => Err(ChannelError::ChannelClosed),
        }
    }

    /// Send a notification. No pending-table entry is created.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        let message = Message::notification(method, params);
        self.inner
            .transport
            .send(message)
            .await
            .map_err(ChannelError::Send)
    }

    /// The transport's connection state, unchanged.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.connection_state()
    }

    /// The transport's human-readable identifier.
    pub fn description(&self) -> String {
        self.inner.transport.description()
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().entries.len()
    }
}

#[async_trait]
impl RequestChannel for StreamBasedChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ChannelResponse, ChannelError> {
        StreamBasedChannel::request(self, method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        StreamBasedChannel::notify(self, method, params).await
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        StreamBasedChannel::connection_state(self)
    }
}

impl ChannelInner {
    fn on_message(self: Arc<Self>, message: Message) {
        match message {
            Message::Request(request) => self.dispatch_request(request),
            Message::Notification(notification) => self.dispatch_notification(notification),
            Message::Response(response) => self.dispatch_response(response),
        }
    }

    /// Requests run in their own task so slow handlers do not stall the
    /// listener; the peer correlates responses by id.
    fn dispatch_request(self: Arc<Self>, request: RequestMessage) {
        tokio::spawn(async move {
            let RequestMessage { method, params, id } = request;

            let response = match &self.handler {
                None => Message::error_response(
                    Some(id),
                    ErrorObject::new(
                        codes::METHOD_NOT_FOUND,
                        format!("No handler installed to answer request `{}`", method),
                    ),
                ),
                Some(handler) => {
                    let handler = handler.clone();
                    let task_method = method.clone();
                    let task_id = id.clone();
                    // Nested spawn contains handler panics; the JoinError
                    // branch answers with a generic internal error and
                    // never echoes panic text to the peer.
                    let task = tokio::spawn(async move {
                        handler
                            .handle_request(&task_method, params, &task_id)
                            .await
                    });
                    match task.await {
                        Ok(Ok(result)) => Message::success(id, result),
                        Ok(Err(error)) => Message::error_response(Some(id), error),
                        Err(join_err) => {
                            self.logger.warn(
                                LogEntry::text("request handler panicked")
                                    .with_error(&join_err.to_string()),
                            );
                            Message::error_response(Some(id), ErrorObject::internal_error())
                        }
                    }
                }
            };

            if let Err(err) = self.transport.send(response).await {
                self.logger
                    .warn(LogEntry::text("failed to send response").with_error(&err.to_string()));
            }
        });
    }

    fn dispatch_notification(self: Arc<Self>, notification: NotificationMessage) {
        let _ = self.notification_tx.send(notification);
    }

    /// Responses complete synchronously in the listener, in arrival order.
    fn dispatch_response(self: Arc<Self>, response: ResponseMessage) {
        let id = match &response.id {
            Some(id) => id.key(),
            None => {
                self.logger
                    .debug(LogEntry::text("dropping response with null id"));
                return;
            }
        };

        let sender = self.pending.lock().unwrap().entries.remove(&id);
        let sender = match sender {
            Some(sender) => sender,
            None => {
                self.logger
                    .debug(LogEntry::text("dropping response for unknown request id"));
                return;
            }
        };

        let outcome = if let Some(result) = response.result {
            Ok(ChannelResponse::Result(result))
        } else if let Some(error) = response.error {
            Ok(ChannelResponse::Error(error))
        } else {
            Err(ChannelError::ProtocolViolation)
        };
        let _ = sender.send(outcome);
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().unwrap();
            pending.entries.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(ChannelError::ChannelClosed));
        }
    }
}

/// Handles notifications sequentially so arrival order is preserved for
/// user handlers. Each handler runs in its own task anyway: a panicking
/// handler must not take the worker down with it.
async fn notification_worker(
    weak: Weak<ChannelInner>,
    mut rx: mpsc::UnboundedReceiver<NotificationMessage>,
) {
    while let Some(notification) = rx.recv().await {
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        let handler = match &inner.handler {
            None => {
                inner.logger.debug(LogEntry::text(
                    "dropping notification: no handler installed",
                ));
                continue;
            }
            Some(handler) => handler.clone(),
        };

        let NotificationMessage { method, params } = notification;
        let task = tokio::spawn(async move { handler.handle_notification(&method, params).await });
        if let Err(join_err) = task.await {
            inner.logger.warn(
                LogEntry::text("notification handler panicked").with_error(&join_err.to_string()),
            );
        }
    }
}

/// Deferred channel construction, materialized at most once.
///
/// Holds the transport until the handler is known. The transport keeps
/// buffering inbound messages in the meantime, so nothing is lost between
/// construction and materialization.
pub struct StreamChannelFactory {
    transport: Mutex<Option<Box<dyn MessageTransport>>>,
    logger: Arc<dyn RpcLogger>,
}

impl StreamChannelFactory {
    pub fn new(transport: Box<dyn MessageTransport>) -> Self {
        Self::with_logger(transport, default_logger())
    }

    pub fn with_logger(transport: Box<dyn MessageTransport>, logger: Arc<dyn RpcLogger>) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            logger,
        }
    }

    /// Build the channel with `handler` installed.
    pub fn materialize_channel(
        &self,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<StreamBasedChannel, StartError> {
        let transport = self
            .transport
            .lock()
            .unwrap()
            .take()
            .ok_or(StartError::AlreadyMaterialized)?;
        Ok(StreamBasedChannel::with_logger(
            transport,
            Some(handler),
            self.logger.clone(),
        ))
    }
}

impl ChannelFactory for StreamChannelFactory {
    fn materialize(
        &self,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<dyn RequestChannel>, StartError> {
        Ok(Arc::new(self.materialize_channel(handler)?))
    }
}
