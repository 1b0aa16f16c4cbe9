//! The typed channel implementation.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use super::{
    BoxFuture, DomainError, HandlerError, NotificationResult, RegisteredMethod, Registration,
    RequestContext, RequestDidErrorEvent, RequestHandlerResult, TypedRpc, UnknownNotification,
    IGNORE_UNEXPECTED_PROPERTIES_MARKER,
};
use crate::channel::{ChannelFactory, ChannelHandler, ChannelResponse, RequestChannel};
use crate::error::{CallError, RegistrationError, StartError};
use crate::logger::{default_logger, LogEntry, RpcLogger};
use crate::message::{codes, ErrorObject, RequestId};
use crate::transport::ConnectionState;
use crate::types::{MethodKind, MethodTypeInfo, NotificationType, RequestType};

/// Options accepted when constructing a [`TypedChannel`].
#[derive(Default)]
pub struct TypedChannelOptions {
    /// Structured sink for diagnostics; defaults to the `tracing` logger.
    pub logger: Option<Arc<dyn RpcLogger>>,
    /// Stamp the `$ignoreUnexpectedProperties` marker on outgoing request
    /// params so the peer's serializers deserialize leniently.
    pub ignore_unexpected_properties_in_responses: bool,
    /// Echo handler failure details to the peer instead of a generic
    /// message. Off by default.
    pub send_exception_details: bool,
}

type ErasedRequestFn<C> =
    dyn Fn(Option<Value>, RequestId, C) -> BoxFuture<Result<Value, ErrorObject>> + Send + Sync;

type ErasedNotificationFn<C> =
    dyn Fn(Option<Value>, C) -> BoxFuture<Result<(), String>> + Send + Sync;

type UnknownNotificationFn<C> =
    dyn Fn(UnknownNotification, C) -> BoxFuture<Result<(), String>> + Send + Sync;

struct RequestEntry<C> {
    registration_id: u64,
    types: MethodTypeInfo,
    handler: Arc<ErasedRequestFn<C>>,
}

struct NotificationEntry<C> {
    token: usize,
    types: MethodTypeInfo,
    handlers: Vec<(u64, Arc<ErasedNotificationFn<C>>)>,
}

enum TableEntry<C> {
    Request(RequestEntry<C>),
    Notification(NotificationEntry<C>),
}

type ErrorListener = Arc<dyn Fn(&RequestDidErrorEvent) + Send + Sync>;

struct ChannelCore<C> {
    factory: Mutex<Option<Box<dyn ChannelFactory>>>,
    channel: OnceLock<Arc<dyn RequestChannel>>,
    table: Mutex<HashMap<String, TableEntry<C>>>,
    unknown_notifications: Mutex<Vec<(u64, Arc<UnknownNotificationFn<C>>)>>,
    error_listeners: Mutex<Vec<(u64, ErrorListener)>>,
    logger: Arc<dyn RpcLogger>,
    ignore_unexpected_properties: bool,
    send_exception_details: bool,
    recv_context: C,
    started: watch::Sender<bool>,
    next_registration: AtomicU64,
}

/// A typed, bidirectional JSON-RPC endpoint.
///
/// Construct it, register handlers, then call [`TypedChannel::start`]
/// exactly once; only then is the listener installed on the underlying
/// channel, so the transport buffers inbound traffic until startup is
/// complete. Sending before `start` fails; registering does not.
///
/// `C` is the receive context cloned into every handler invocation; `S`
/// is the send context accepted by requests and notifications (consumed
/// by context-mapping wrappers, ignored here).
///
/// Cheap to clone; all clones share the dispatch table and the channel.
pub struct TypedChannel<C = (), S = ()> {
    inner: Arc<ChannelCore<C>>,
    _send: PhantomData<fn(S) -> S>,
}

impl<C, S> std::fmt::Debug for TypedChannel<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedChannel").finish_non_exhaustive()
    }
}

impl<C, S> Clone for TypedChannel<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _send: PhantomData,
        }
    }
}

impl<C, S> TypedChannel<C, S>
where
    C: Clone + Default + Send + Sync + 'static,
    S: Send + 'static,
{
    /// Construct with a default receive context.
    pub fn new(factory: impl ChannelFactory, options: TypedChannelOptions) -> Self {
        Self::with_receive_context(factory, options, C::default())
    }
}

impl<C, S> TypedChannel<C, S>
where
    C: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    /// Construct with an explicit receive context template.
    pub fn with_receive_context(
        factory: impl ChannelFactory,
        options: TypedChannelOptions,
        context: C,
    ) -> Self {
        let logger = options.logger.unwrap_or_else(default_logger);
        let (started, _) = watch::channel(false);

        let inner = Arc::new(ChannelCore {
            factory: Mutex::new(Some(Box::new(factory) as Box<dyn ChannelFactory>)),
            channel: OnceLock::new(),
            table: Mutex::new(HashMap::new()),
            unknown_notifications: Mutex::new(Vec::new()),
            error_listeners: Mutex::new(Vec::new()),
            logger,
            ignore_unexpected_properties: options.ignore_unexpected_properties_in_responses,
            send_exception_details: options.send_exception_details,
            recv_context: context,
            started,
            next_registration: AtomicU64::new(0),
        });

        // Development aid: a channel that is never started is almost
        // always a bug at the call site.
        #[cfg(debug_assertions)]
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            handle.spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if let Some(core) = weak.upgrade() {
                    if !*core.started.borrow() {
                        core.logger.warn(LogEntry::text(
                            "typed channel was constructed but start() was not called within 1s",
                        ));
                    }
                }
            });
        }

        Self {
            inner,
            _send: PhantomData,
        }
    }

    /// Install the dispatcher on the underlying channel and begin
    /// processing inbound messages. Fails on the second call.
    pub fn start(&self) -> Result<(), StartError> {
        let factory = self
            .inner
            .factory
            .lock()
            .unwrap()
            .take()
            .ok_or(StartError::AlreadyStarted)?;

        let dispatcher = Arc::new(Dispatcher {
            core: Arc::downgrade(&self.inner),
        });
        let channel = factory.materialize(dispatcher)?;
        let _ = self.inner.channel.set(channel);
        let _ = self.inner.started.send(true);
        Ok(())
    }

    /// Resolves once [`TypedChannel::start`] has been called.
    pub async fn started(&self) {
        let mut rx = self.inner.started.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The transport's connection state; `None` until started.
    pub fn connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.inner.channel.get().map(|c| c.connection_state())
    }

    /// Register the single request handler for `descriptor`'s method.
    pub fn register_request<P, R, E, F, Fut>(
        &self,
        descriptor: &RequestType<P, R, E>,
        handler: F,
    ) -> Result<Registration, RegistrationError>
    where
        P: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(P, RequestContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestHandlerResult<R, E>> + Send + 'static,
    {
        let method = descriptor
            .method()
            .ok_or(RegistrationError::MissingMethodName)?
            .to_string();

        let handler = erase_request_handler(
            descriptor,
            handler,
            self.inner.logger.clone(),
            self.inner.send_exception_details,
        );

        let registration_id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.inner.table.lock().unwrap();
            match table.get(&method) {
                Some(TableEntry::Request(_)) => {
                    return Err(RegistrationError::DuplicateRequest(method))
                }
                Some(TableEntry::Notification(_)) => {
                    return Err(RegistrationError::ConflictingKind(method))
                }
                None => {}
            }
            table.insert(
                method.clone(),
                TableEntry::Request(RequestEntry {
                    registration_id,
                    types: descriptor.type_info(),
                    handler,
                }),
            );
        }

        let core = Arc::downgrade(&self.inner);
        Ok(Registration::new(move || {
            if let Some(core) = core.upgrade() {
                let mut table = core.table.lock().unwrap();
                if let Some(TableEntry::Request(entry)) = table.get(&method) {
                    if entry.registration_id == registration_id {
                        table.remove(&method);
                    }
                }
            }
        }))
    }

    /// Add a notification handler. Registering the same descriptor again
    /// adds to the handler set; a different descriptor under the same
    /// method fails.
    pub fn register_notification<P, F, Fut>(
        &self,
        descriptor: &NotificationType<P>,
        handler: F,
    ) -> Result<Registration, RegistrationError>
    where
        P: Send + 'static,
        F: Fn(P, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NotificationResult> + Send + 'static,
    {
        let method = descriptor
            .method()
            .ok_or(RegistrationError::MissingMethodName)?
            .to_string();

        let handler = erase_notification_handler(descriptor, handler);
        let registration_id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);

        {
            let mut table = self.inner.table.lock().unwrap();
            match table.get_mut(&method) {
                Some(TableEntry::Request(_)) => {
                    return Err(RegistrationError::ConflictingKind(method))
                }
                Some(TableEntry::Notification(entry)) => {
                    if entry.token != descriptor.token() {
                        return Err(RegistrationError::ConflictingDescriptor(method));
                    }
                    entry.handlers.push((registration_id, handler));
                }
                None => {
                    table.insert(
                        method.clone(),
                        TableEntry::Notification(NotificationEntry {
                            token: descriptor.token(),
                            types: descriptor.type_info(),
                            handlers: vec![(registration_id, handler)],
                        }),
                    );
                }
            }
        }

        let core = Arc::downgrade(&self.inner);
        Ok(Registration::new(move || {
            if let Some(core) = core.upgrade() {
                let mut table = core.table.lock().unwrap();
                if let Some(TableEntry::Notification(entry)) = table.get_mut(&method) {
                    entry.handlers.retain(|(id, _)| *id != registration_id);
                    if entry.handlers.is_empty() {
                        table.remove(&method);
                    }
                }
            }
        }))
    }

    /// Handlers invoked for notifications whose method is not in the
    /// dispatch table. With none installed such notifications are logged
    /// at debug and dropped.
    pub fn register_unknown_notification_handler<F, Fut>(&self, handler: F) -> Registration
    where
        F: Fn(UnknownNotification, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NotificationResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Arc<UnknownNotificationFn<C>> = Arc::new(move |notification, context| {
            let handler = handler.clone();
            Box::pin(async move {
                handler(notification, context)
                    .await
                    .map_err(|e| e.to_string())
            })
        });

        let registration_id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        self.inner
            .unknown_notifications
            .lock()
            .unwrap()
            .push((registration_id, erased));

        let core = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(core) = core.upgrade() {
                core.unknown_notifications
                    .lock()
                    .unwrap()
                    .retain(|(id, _)| *id != registration_id);
            }
        })
    }

    /// Observe every error surfaced to a caller of this channel.
    pub fn on_request_did_error(
        &self,
        listener: impl Fn(&RequestDidErrorEvent) + Send + Sync + 'static,
    ) -> Registration {
        let registration_id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        self.inner
            .error_listeners
            .lock()
            .unwrap()
            .push((registration_id, Arc::new(listener)));

        let core = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(core) = core.upgrade() {
                core.error_listeners
                    .lock()
                    .unwrap()
                    .retain(|(id, _)| *id != registration_id);
            }
        })
    }

    /// Snapshot of the dispatch table, sorted by method name.
    pub fn registered_methods(&self) -> Vec<RegisteredMethod> {
        let table = self.inner.table.lock().unwrap();
        let mut methods: Vec<RegisteredMethod> = table
            .iter()
            .map(|(method, entry)| match entry {
                TableEntry::Request(e) => RegisteredMethod {
                    kind: MethodKind::Request,
                    method: method.clone(),
                    types: e.types.clone(),
                },
                TableEntry::Notification(e) => RegisteredMethod {
                    kind: MethodKind::Notification,
                    method: method.clone(),
                    types: e.types.clone(),
                },
            })
            .collect();
        methods.sort_by(|a, b| a.method.cmp(&b.method));
        methods
    }

    async fn perform_request<P: 'static, R: 'static, E: 'static>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        optional: bool,
    ) -> Result<Option<R>, CallError<E>> {
        let channel = self
            .inner
            .channel
            .get()
            .cloned()
            .ok_or(CallError::NotStarted)?;
        let method = descriptor
            .method()
            .ok_or(CallError::MissingMethodName)?
            .to_string();

        let mut params = descriptor
            .params()
            .serialize(&args)
            .map_err(|message| CallError::Serialize {
                what: "request params",
                message,
            })?;
        if !crate::message::is_valid_params_shape(&params) {
            return Err(CallError::InvalidParamsShape);
        }
        if self.inner.ignore_unexpected_properties {
            if let Value::Object(map) = &mut params {
                map.insert(
                    IGNORE_UNEXPECTED_PROPERTIES_MARKER.to_string(),
                    Value::Bool(true),
                );
            }
        }
        let params = match params {
            Value::Null => None,
            other => Some(other),
        };

        match channel.request(&method, params).await {
            Err(channel_err) => {
                self.fire_request_did_error(&method, None, &channel_err.to_string());
                Err(channel_err.into())
            }
            Ok(ChannelResponse::Result(value)) => {
                match descriptor.result().deserialize(value) {
                    Ok(result) => Ok(Some(result)),
                    Err(message) => {
                        self.fire_request_did_error(&method, None, &message);
                        Err(CallError::Deserialize {
                            what: "response result",
                            message,
                        })
                    }
                }
            }
            Ok(ChannelResponse::Error(error)) => {
                if optional && error.code == codes::METHOD_NOT_FOUND {
                    return Ok(None);
                }
                // Error data of protocol-level errors (invalid params,
                // method not found, ...) is shaped by the peer's runtime,
                // not by the descriptor's error type; only application
                // errors run through the error serializer.
                let data = match error.data {
                    Some(value) if !is_protocol_code(error.code) => {
                        match descriptor.error().deserialize(value) {
                            Ok(data) => Some(data),
                            Err(message) => {
                                self.fire_request_did_error(
                                    &method,
                                    Some(error.code),
                                    &message,
                                );
                                return Err(CallError::Deserialize {
                                    what: "error data",
                                    message,
                                });
                            }
                        }
                    }
                    _ => None,
                };
                self.fire_request_did_error(&method, Some(error.code), &error.message);
                Err(CallError::Handler {
                    code: error.code,
                    message: error.message,
                    data,
                })
            }
        }
    }

    async fn perform_notify<P: 'static>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
    ) -> Result<(), CallError<()>> {
        let channel = self
            .inner
            .channel
            .get()
            .cloned()
            .ok_or(CallError::NotStarted)?;
        let method = descriptor
            .method()
            .ok_or(CallError::MissingMethodName)?
            .to_string();

        let params = descriptor
            .params()
            .serialize(&args)
            .map_err(|message| CallError::Serialize {
                what: "notification params",
                message,
            })?;
        if !crate::message::is_valid_params_shape(&params) {
            return Err(CallError::InvalidParamsShape);
        }
        let params = match params {
            Value::Null => None,
            other => Some(other),
        };

        channel.notify(&method, params).await.map_err(Into::into)
    }

    fn fire_request_did_error(&self, method: &str, code: Option<i64>, message: &str) {
        let event = RequestDidErrorEvent {
            method: method.to_string(),
            code,
            message: message.to_string(),
        };
        let listeners: Vec<ErrorListener> = self
            .inner
            .error_listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Context-free convenience surface; `S: Default` supplies the send
/// context.
impl<C, S> TypedChannel<C, S>
where
    C: Clone + Send + Sync + 'static,
    S: Default + Send + 'static,
{
    /// Send a typed request and await its typed result.
    pub async fn request<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
    ) -> Result<R, CallError<E>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        match self.perform_request(descriptor, args, false).await? {
            Some(result) => Ok(result),
            None => Err(CallError::Handler {
                code: codes::METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
                data: None,
            }),
        }
    }

    /// Send an optional typed request; an unknown method resolves to
    /// `Ok(None)`.
    pub async fn request_optional<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
    ) -> Result<Option<R>, CallError<E>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        self.perform_request(descriptor, args, true).await
    }

    /// Send a typed notification.
    pub async fn notify<P>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
    ) -> Result<(), CallError<()>>
    where
        P: Send + Sync + 'static,
    {
        self.perform_notify(descriptor, args).await
    }
}

impl<C, S> TypedRpc<C, S> for TypedChannel<C, S>
where
    C: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
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
        Fut: Future<Output = RequestHandlerResult<R, E>> + Send + 'static,
    {
        TypedChannel::register_request(self, descriptor, handler)
    }

    fn register_notification<P, F, Fut>(
        &self,
        descriptor: &NotificationType<P>,
        handler: F,
    ) -> Result<Registration, RegistrationError>
    where
        P: Send + 'static,
        F: Fn(P, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NotificationResult> + Send + 'static,
    {
        TypedChannel::register_notification(self, descriptor, handler)
    }

    fn request_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        _context: S,
    ) -> BoxFuture<Result<R, CallError<E>>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let this = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move {
            match this.perform_request(&descriptor, args, false).await? {
                Some(result) => Ok(result),
                None => Err(CallError::Handler {
                    code: codes::METHOD_NOT_FOUND,
                    message: "Method not found".to_string(),
                    data: None,
                }),
            }
        })
    }

    fn request_optional_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        _context: S,
    ) -> BoxFuture<Result<Option<R>, CallError<E>>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let this = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move { this.perform_request(&descriptor, args, true).await })
    }

    fn notify_with<P>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
        _context: S,
    ) -> BoxFuture<Result<(), CallError<()>>>
    where
        P: Send + Sync + 'static,
    {
        let this = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move { this.perform_notify(&descriptor, args).await })
    }

    fn registered_methods(&self) -> Vec<RegisteredMethod> {
        TypedChannel::registered_methods(self)
    }
}

/// `true` for codes owned by the JSON-RPC protocol layer rather than the
/// application (`-32768..=-32000`).
fn is_protocol_code(code: i64) -> bool {
    (-32768..=-32000).contains(&code)
}

/// Remove the lenient-deserialization marker before params reach a
/// serializer.
fn strip_marker(params: Option<Value>) -> Value {
    match params {
        Some(Value::Object(mut map)) => {
            map.remove(IGNORE_UNEXPECTED_PROPERTIES_MARKER);
            Value::Object(map)
        }
        Some(other) => other,
        None => Value::Null,
    }
}

fn erase_request_handler<C, P, R, E, F, Fut>(
    descriptor: &RequestType<P, R, E>,
    handler: F,
    logger: Arc<dyn RpcLogger>,
    send_exception_details: bool,
) -> Arc<ErasedRequestFn<C>>
where
    C: Send + 'static,
    P: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(P, RequestContext<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RequestHandlerResult<R, E>> + Send + 'static,
{
    let params_serializer = descriptor.params().clone();
    let result_serializer = descriptor.result().clone();
    let error_serializer = descriptor.error().clone();
    let handler = Arc::new(handler);

    Arc::new(move |params, request_id, context| {
        let params_serializer = params_serializer.clone();
        let result_serializer = result_serializer.clone();
        let error_serializer = error_serializer.clone();
        let handler = handler.clone();
        let logger = logger.clone();

        Box::pin(async move {
            let args = match params_serializer.deserialize(strip_marker(params)) {
                Ok(args) => args,
                Err(message) => return Err(ErrorObject::invalid_params(vec![message])),
            };

            let outcome = handler(
                args,
                RequestContext {
                    request_id,
                    context,
                },
            )
            .await;

            match outcome {
                Ok(result) => match result_serializer.serialize(&result) {
                    Ok(value) => Ok(value),
                    Err(message) => {
                        logger.warn(
                            LogEntry::text("failed to serialize handler result")
                                .with_error(&message),
                        );
                        Err(unexpected_error(send_exception_details, &message))
                    }
                },
                Err(HandlerError::Domain(domain)) => {
                    Err(domain_to_error_object(domain, &error_serializer, &logger)?)
                }
                Err(HandlerError::Response(error)) => Err(error),
                Err(HandlerError::Unexpected(err)) => {
                    let text = err.to_string();
                    logger.warn(
                        LogEntry::text("request handler failed unexpectedly").with_error(&text),
                    );
                    Err(unexpected_error(send_exception_details, &text))
                }
            }
        })
    })
}

/// Convert a handler's domain error into the wire error object.
///
/// Returns `Err` in both positions: the outer error is the wire response
/// either way; nesting keeps the serializer-failure branch on the same
/// path as the success branch.
fn domain_to_error_object<E: 'static>(
    domain: DomainError<E>,
    error_serializer: &crate::serializer::SharedSerializer<E>,
    logger: &Arc<dyn RpcLogger>,
) -> Result<ErrorObject, ErrorObject> {
    let data = match &domain.data {
        None => None,
        Some(data) => match error_serializer.serialize(data) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(message) => {
                logger.warn(
                    LogEntry::text("failed to serialize domain error data").with_error(&message),
                );
                return Err(ErrorObject::unexpected_server_error());
            }
        },
    };

    let code = domain.code.unwrap_or(codes::GENERIC_APPLICATION_ERROR);
    let message = domain
        .message
        .unwrap_or_else(|| "An error was returned.".to_string());
    let mut error = ErrorObject::new(code, message);
    if let Some(data) = data {
        error = error.with_data(data);
    }
    Ok(error)
}

fn unexpected_error(send_exception_details: bool, details: &str) -> ErrorObject {
    if send_exception_details {
        ErrorObject::new(codes::UNEXPECTED_SERVER_ERROR, details.to_string())
    } else {
        ErrorObject::unexpected_server_error()
    }
}

fn erase_notification_handler<C, P, F, Fut>(
    descriptor: &NotificationType<P>,
    handler: F,
) -> Arc<ErasedNotificationFn<C>>
where
    C: Send + 'static,
    P: Send + 'static,
    F: Fn(P, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = NotificationResult> + Send + 'static,
{
    let params_serializer = descriptor.params().clone();
    let handler = Arc::new(handler);

    Arc::new(move |params, context| {
        let params_serializer = params_serializer.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let args = params_serializer
                .deserialize(strip_marker(params))
                .map_err(|message| format!("invalid notification params: {}", message))?;
            handler(args, context).await.map_err(|e| e.to_string())
        })
    })
}

/// The [`ChannelHandler`] installed on the stream channel at start.
struct Dispatcher<C> {
    core: Weak<ChannelCore<C>>,
}

#[async_trait]
impl<C> ChannelHandler for Dispatcher<C>
where
    C: Clone + Send + Sync + 'static,
{
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        id: &RequestId,
    ) -> Result<Value, ErrorObject> {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return Err(ErrorObject::unexpected_server_error()),
        };

        let handler = {
            let table = core.table.lock().unwrap();
            match table.get(method) {
                None => return Err(ErrorObject::method_not_found(method)),
                Some(TableEntry::Notification(_)) => {
                    return Err(ErrorObject::invalid_request(format!(
                        "Method `{}` is registered as a notification and cannot be requested",
                        method
                    )))
                }
                Some(TableEntry::Request(entry)) => entry.handler.clone(),
            }
        };

        handler(params, id.clone(), core.recv_context.clone()).await
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return,
        };

        let handlers = {
            let table = core.table.lock().unwrap();
            match table.get(method) {
                Some(TableEntry::Notification(entry)) => Some(
                    entry
                        .handlers
                        .iter()
                        .map(|(_, h)| h.clone())
                        .collect::<Vec<_>>(),
                ),
                Some(TableEntry::Request(_)) => {
                    core.logger.warn(LogEntry::text(
                        "dropping notification for a method registered as a request",
                    ));
                    return;
                }
                None => None,
            }
        };

        match handlers {
            Some(handlers) => {
                for handler in handlers {
                    if let Err(message) = handler(params.clone(), core.recv_context.clone()).await {
                        core.logger.warn(
                            LogEntry::text("notification handler failed").with_error(&message),
                        );
                    }
                }
            }
            None => {
                let unknown: Vec<Arc<UnknownNotificationFn<C>>> = core
                    .unknown_notifications
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                if unknown.is_empty() {
                    core.logger
                        .debug(LogEntry::text("dropping unhandled notification"));
                    return;
                }
                let notification = UnknownNotification {
                    method: method.to_string(),
                    params,
                };
                for handler in unknown {
                    if let Err(message) =
                        handler(notification.clone(), core.recv_context.clone()).await
                    {
                        core.logger.warn(
                            LogEntry::text("unknown-notification handler failed")
                                .with_error(&message),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamChannelFactory;
    use crate::logger::test_support::RecordingLogger;
    use crate::message::Message;
    use crate::serializer;
    use crate::transport::{pair, MessageTransport, PairTransport};
    use crate::types::{notification_type, request_type};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CalcParams {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CalcError {
        #[serde(rename = "errorMessage")]
        error_message: String,
    }

    fn calculate() -> RequestType<CalcParams, String, CalcError> {
        request_type()
            .method("calculate")
            .params(serializer::of::<CalcParams>())
            .result(serializer::of::<String>())
            .error(serializer::of::<CalcError>())
            .build()
    }

    fn progress() -> NotificationType<f64> {
        notification_type()
            .method("progress")
            .params(serializer::of::<f64>())
            .build()
    }

    fn typed(transport: PairTransport) -> TypedChannel {
        TypedChannel::new(
            StreamChannelFactory::new(Box::new(transport)),
            TypedChannelOptions::default(),
        )
    }

    fn typed_pair() -> (TypedChannel, TypedChannel) {
        let (a, b) = pair();
        (typed(a), typed(b))
    }

    fn register_calculate(channel: &TypedChannel) -> Registration {
        channel
            .register_request(&calculate(), |params: CalcParams, _ctx| async move {
                if params.name == "bar" {
                    Err(HandlerError::Domain(
                        DomainError::message("`bar` is not supported.").with_data(CalcError {
                            error_message: "`bar` is not supported.".to_string(),
                        }),
                    ))
                } else {
                    Ok(format!("bla{}", params.name))
                }
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_typed_request_success() {
        let (client, server) = typed_pair();
        register_calculate(&server);
        client.start().unwrap();
        server.start().unwrap();

        let result = client
            .request(&calculate(), CalcParams { name: "foo".into() })
            .await
            .unwrap();
        assert_eq!(result, "blafoo");
    }

    #[tokio::test]
    async fn test_send_before_start_fails_but_registration_succeeds() {
        let (client, _server) = typed_pair();
        register_calculate(&client);

        let err = client
            .request(&calculate(), CalcParams { name: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NotStarted));

        let err = client.notify(&progress(), 0.5).await.unwrap_err();
        assert!(matches!(err, CallError::NotStarted));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (client, _server) = typed_pair();
        client.start().unwrap();
        assert!(matches!(client.start(), Err(StartError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_started_future_resolves() {
        let (client, _server) = typed_pair();

        let waiter = client.clone();
        let waited = tokio::spawn(async move { waiter.started().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waited.is_finished());

        client.start().unwrap();
        waited.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_messages_buffer_until_start() {
        let (raw, b) = pair();
        let server = typed(b);
        register_calculate(&server);

        let responses = Arc::new(StdMutex::new(Vec::new()));
        let responses_clone = responses.clone();
        raw.set_listener(Arc::new(move |m| {
            responses_clone.lock().unwrap().push(m);
        }));

        // Request arrives before the server starts; the transport buffers.
        raw.send(Message::request(
            "calculate",
            Some(json!({"name": "early"})),
            RequestId::Number(0),
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(responses.lock().unwrap().is_empty());

        server.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Message::Response(resp) => assert_eq!(resp.result, Some(json!("blaearly"))),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_registration_fails() {
        let (client, _server) = typed_pair();
        let descriptor = calculate();

        client
            .register_request(&descriptor, |_: CalcParams, _ctx| async {
                Ok("".to_string())
            })
            .unwrap();

        let err = client
            .register_request(&descriptor, |_: CalcParams, _ctx| async {
                Ok("".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn test_notification_set_semantics() {
        let (client, server) = typed_pair();
        let descriptor = progress();

        let seen = Arc::new(StdMutex::new(Vec::new()));

        let seen_one = seen.clone();
        server
            .register_notification(&descriptor, move |value: f64, _ctx| {
                let seen = seen_one.clone();
                async move {
                    seen.lock().unwrap().push(("one", value));
                    Ok(())
                }
            })
            .unwrap();

        // Same descriptor: adds to the set.
        let seen_two = seen.clone();
        let second = server
            .register_notification(&descriptor, move |value: f64, _ctx| {
                let seen = seen_two.clone();
                async move {
                    seen.lock().unwrap().push(("two", value));
                    Ok(())
                }
            })
            .unwrap();

        // Different descriptor under the same method: rejected.
        let conflicting = progress();
        let err = server
            .register_notification(&conflicting, |_: f64, _ctx| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::ConflictingDescriptor(_)));

        // Request registration over a notification entry: rejected.
        let as_request = request_type()
            .method("progress")
            .params(serializer::of::<f64>())
            .build();
        let err = server
            .register_request(&as_request, |_: f64, _ctx| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::ConflictingKind(_)));

        client.start().unwrap();
        server.start().unwrap();

        client.notify(&descriptor, 0.25).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("one", 0.25), ("two", 0.25)]
        );

        // Disposing one handler leaves the other.
        second.dispose();
        client.notify(&descriptor, 0.5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen.lock().unwrap().last(), Some(&("one", 0.5)));
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let (client, server) = typed_pair();
        client.start().unwrap();
        server.start().unwrap();

        let err = client
            .request(&calculate(), CalcParams { name: "foo".into() })
            .await
            .unwrap_err();
        match err {
            CallError::Handler { code, .. } => assert_eq!(code, codes::METHOD_NOT_FOUND),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_optional_request_resolves_to_none() {
        let (client, server) = typed_pair();
        client.start().unwrap();
        server.start().unwrap();

        let optional = request_type()
            .method("calculate")
            .params(serializer::of::<CalcParams>())
            .result(serializer::of::<String>())
            .error(serializer::of::<CalcError>())
            .optional()
            .build();

        let result = client
            .request_optional(&optional, CalcParams { name: "foo".into() })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_domain_error_roundtrip() {
        let (client, server) = typed_pair();
        register_calculate(&server);
        client.start().unwrap();
        server.start().unwrap();

        let err = client
            .request(&calculate(), CalcParams { name: "bar".into() })
            .await
            .unwrap_err();
        match err {
            CallError::Handler {
                code,
                message,
                data,
            } => {
                assert_eq!(code, codes::GENERIC_APPLICATION_ERROR);
                assert_eq!(message, "`bar` is not supported.");
                assert_eq!(
                    data,
                    Some(CalcError {
                        error_message: "`bar` is not supported.".to_string()
                    })
                );
            }
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_params_reported_with_serializer_errors() {
        let (client, server) = typed_pair();
        register_calculate(&server);
        client.start().unwrap();
        server.start().unwrap();

        // Wrong param type on the wire, bypassing the typed client path.
        let raw = unverified_calculate_request(&client, json!({"name": 42})).await;
        match raw {
            CallError::Handler { code, .. } => assert_eq!(code, codes::INVALID_PARAMS),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    async fn unverified_calculate_request(
        client: &TypedChannel,
        params: Value,
    ) -> CallError<Value> {
        let raw = crate::types::unverified_request_type("calculate");
        client.request(&raw, params).await.unwrap_err()
    }

    #[tokio::test]
    async fn test_request_for_notification_method_is_invalid_request() {
        let (client, server) = typed_pair();
        server
            .register_notification(&progress(), |_: f64, _ctx| async { Ok(()) })
            .unwrap();
        client.start().unwrap();
        server.start().unwrap();

        let raw = crate::types::unverified_request_type("progress");
        let err = client.request(&raw, json!({})).await.unwrap_err();
        match err {
            CallError::Handler { code, .. } => assert_eq!(code, codes::INVALID_REQUEST),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_error_hides_details_by_default() {
        let (client, server) = typed_pair();
        server
            .register_request(&calculate(), |_: CalcParams, _ctx| async {
                Err(HandlerError::Unexpected("database caught fire".into()))
            })
            .unwrap();
        client.start().unwrap();
        server.start().unwrap();

        let err = client
            .request(&calculate(), CalcParams { name: "x".into() })
            .await
            .unwrap_err();
        match err {
            CallError::Handler { code, message, .. } => {
                assert_eq!(code, codes::UNEXPECTED_SERVER_ERROR);
                assert!(!message.contains("database"));
            }
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_error_echoes_details_when_enabled() {
        let (a, b) = pair();
        let client = typed(a);
        let server: TypedChannel = TypedChannel::new(
            StreamChannelFactory::new(Box::new(b)),
            TypedChannelOptions {
                send_exception_details: true,
                ..Default::default()
            },
        );
        server
            .register_request(&calculate(), |_: CalcParams, _ctx| async {
                Err(HandlerError::Unexpected("database caught fire".into()))
            })
            .unwrap();
        client.start().unwrap();
        server.start().unwrap();

        let err = client
            .request(&calculate(), CalcParams { name: "x".into() })
            .await
            .unwrap_err();
        match err {
            CallError::Handler { message, .. } => assert!(message.contains("database")),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forwarded_response_error_keeps_fields() {
        let (client, server) = typed_pair();
        server
            .register_request(&calculate(), |_: CalcParams, _ctx| async {
                Err(HandlerError::Response(
                    ErrorObject::new(-12345, "custom failure").with_data(json!({"hint": "x"})),
                ))
            })
            .unwrap();
        client.start().unwrap();
        server.start().unwrap();

        let raw = crate::types::unverified_request_type("calculate");
        let err = client.request(&raw, json!({"name": "x"})).await.unwrap_err();
        match err {
            CallError::Handler {
                code,
                message,
                data,
            } => {
                assert_eq!(code, -12345);
                assert_eq!(message, "custom failure");
                assert_eq!(data, Some(json!({"hint": "x"})));
            }
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scalar_params_rejected_before_send() {
        let (client, server) = typed_pair();
        client.start().unwrap();
        server.start().unwrap();

        let scalar = request_type()
            .method("scalar")
            .params(serializer::of::<String>())
            .build();
        let err = client.request(&scalar, "oops".to_string()).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidParamsShape));
    }

    #[tokio::test]
    async fn test_notification_failure_is_logged_not_answered() {
        let (a, b) = pair();
        let logger = Arc::new(RecordingLogger::default());
        let client = typed(a);
        let server: TypedChannel = TypedChannel::new(
            StreamChannelFactory::new(Box::new(b)),
            TypedChannelOptions {
                logger: Some(logger.clone()),
                ..Default::default()
            },
        );
        server
            .register_notification(&progress(), |_: f64, _ctx| async {
                Err("progress sink unavailable".into())
            })
            .unwrap();
        client.start().unwrap();
        server.start().unwrap();

        client.notify(&progress(), 1.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let warnings = logger.texts("warn");
        assert!(warnings.iter().any(|w| w.contains("notification handler")));
    }

    #[tokio::test]
    async fn test_unknown_notification_handlers_are_invoked() {
        let (client, server) = typed_pair();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        server.register_unknown_notification_handler(move |notification, _ctx| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().unwrap().push(notification.method);
                Ok(())
            }
        });
        client.start().unwrap();
        server.start().unwrap();

        client
            .notify(&progress(), 0.1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["progress".to_string()]);
    }

    #[tokio::test]
    async fn test_disposed_request_registration_is_gone() {
        let (client, server) = typed_pair();
        let registration = register_calculate(&server);
        client.start().unwrap();
        server.start().unwrap();

        registration.dispose();

        let err = client
            .request(&calculate(), CalcParams { name: "foo".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_request_did_error_event_fires() {
        let (client, server) = typed_pair();
        client.start().unwrap();
        server.start().unwrap();

        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        client.on_request_did_error(move |event| {
            events_clone
                .lock()
                .unwrap()
                .push((event.method.clone(), event.code));
        });

        let _ = client
            .request(&calculate(), CalcParams { name: "foo".into() })
            .await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ("calculate".to_string(), Some(codes::METHOD_NOT_FOUND))
        );
    }

    #[tokio::test]
    async fn test_marker_is_stamped_and_stripped() {
        // Client stamps the marker on outgoing params.
        let (a, raw_server) = pair();
        let client: TypedChannel = TypedChannel::new(
            StreamChannelFactory::new(Box::new(a)),
            TypedChannelOptions {
                ignore_unexpected_properties_in_responses: true,
                ..Default::default()
            },
        );
        client.start().unwrap();

        let on_wire = Arc::new(StdMutex::new(Vec::new()));
        let on_wire_clone = on_wire.clone();
        raw_server.set_listener(Arc::new(move |m| {
            on_wire_clone.lock().unwrap().push(m);
        }));

        let caller = client.clone();
        tokio::spawn(async move {
            let _ = caller
                .request(&calculate(), CalcParams { name: "foo".into() })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        {
            let on_wire = on_wire.lock().unwrap();
            match &on_wire[0] {
                Message::Request(r) => {
                    let params = r.params.as_ref().unwrap();
                    assert_eq!(params[IGNORE_UNEXPECTED_PROPERTIES_MARKER], true);
                }
                other => panic!("expected request, got {:?}", other),
            }
        }

        // A receiving channel strips the marker before deserialization: a
        // strict params type would otherwise reject it.
        #[derive(Debug, Serialize, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct StrictParams {
            name: String,
        }

        let (c, d) = pair();
        let sender = typed(c);
        let receiver = typed(d);
        let strict = request_type()
            .method("strict")
            .params(serializer::of::<StrictParams>())
            .result(serializer::of::<String>())
            .build();
        receiver
            .register_request(&strict, |params: StrictParams, _ctx| async move {
                Ok(params.name)
            })
            .unwrap();
        sender.start().unwrap();
        receiver.start().unwrap();

        let raw = crate::types::unverified_request_type("strict");
        let result = sender
            .request(
                &raw,
                json!({"name": "ok", IGNORE_UNEXPECTED_PROPERTIES_MARKER: true}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!("ok"));
    }

    #[tokio::test]
    async fn test_registered_methods_snapshot() {
        let (_client, server) = typed_pair();
        register_calculate(&server);
        server
            .register_notification(&progress(), |_: f64, _ctx| async { Ok(()) })
            .unwrap();

        let methods = server.registered_methods();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].method, "calculate");
        assert_eq!(methods[0].kind, MethodKind::Request);
        assert!(methods[0].types.params.is_some());
        assert!(methods[0].types.result.is_some());
        assert_eq!(methods[1].method, "progress");
        assert_eq!(methods[1].kind, MethodKind::Notification);
    }

    #[tokio::test]
    async fn test_receive_context_reaches_handlers() {
        let (a, b) = pair();
        let client: TypedChannel = typed(a);
        let server: TypedChannel<&'static str> = TypedChannel::with_receive_context(
            StreamChannelFactory::new(Box::new(b)),
            TypedChannelOptions::default(),
            "session-7",
        );

        let seen = Arc::new(StdMutex::new(None));
        let seen_clone = seen.clone();
        server
            .register_request(&calculate(), move |params: CalcParams, ctx| {
                let seen = seen_clone.clone();
                async move {
                    *seen.lock().unwrap() = Some(ctx.context);
                    Ok(params.name)
                }
            })
            .unwrap();
        client.start().unwrap();
        server.start().unwrap();

        client
            .request(&calculate(), CalcParams { name: "x".into() })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some("session-7"));
    }
}
