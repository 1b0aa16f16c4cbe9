//! Contract runtime: binding two typed interfaces to handlers and proxies.
//!
//! A contract is a pair of method-name → descriptor maps, one per peer
//! role ("server" and "client"), plus a name and free-form tags. From a
//! contract and a typed channel, each role derives two things:
//!
//! - a **counterpart proxy** for calling every method on the peer's side
//! - a **handler installation** wiring its own side's methods to user
//!   functions
//!
//! Request handlers are mandatory for the role's request methods;
//! notification handlers are optional. Installed handlers receive a
//! [`HandlerInfo`] carrying the request id, the receive context, a
//! reference to the counterpart for back-calls, and a domain-error
//! factory.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = ContractBuilder::new("calc");
//! let calculate = builder.server_request("calculate", request_type()
//!     .params(serializer::of::<CalcParams>())
//!     .result(serializer::of::<String>())
//!     .build());
//! let progress = builder.client_notification("progress", notification_type()
//!     .params(serializer::of::<Progress>())
//!     .build());
//! let contract = builder.build();
//!
//! let handlers = ContractHandlers::new().on_request(&calculate, |p, info| async move {
//!     info.counterpart().notify(&progress, Progress { progress: 1.0 }).await.ok();
//!     Ok(format!("bla{}", p.name))
//! });
//! let server = contract.register_server(&channel, handlers)?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::channel::StreamChannelFactory;
use crate::error::{CallError, ContractError, RegistrationError};
use crate::message::RequestId;
use crate::transport::MessageTransport;
use crate::typed::{
    BoxFuture, DomainError, HandlerError, NotificationResult, Registration, Registrations,
    RequestContext, RequestHandlerResult, TypedChannel, TypedChannelOptions, TypedRpc,
};
use crate::types::{MethodKind, MethodTypeInfo, NotificationType, RequestType};

/// Erased view of one contract method, kept for validation and reflection.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub method: String,
    pub kind: MethodKind,
    pub optional: bool,
    pub types: MethodTypeInfo,
}

/// One role's method-name → descriptor map.
#[derive(Debug, Clone, Default)]
pub struct InterfaceSpec {
    methods: BTreeMap<String, MethodSpec>,
}

impl InterfaceSpec {
    pub fn get(&self, method: &str) -> Option<&MethodSpec> {
        self.methods.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodSpec> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Assembles a [`Contract`]. Descriptors are added under their map key;
/// the key is bound into the descriptor (`with_method`) and the bound
/// clone is returned for use at call and registration sites.
pub struct ContractBuilder {
    name: String,
    tags: Vec<String>,
    server: InterfaceSpec,
    client: InterfaceSpec,
}

impl ContractBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            server: InterfaceSpec::default(),
            client: InterfaceSpec::default(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a request to the server side; returns the name-bound clone.
    pub fn server_request<P: 'static, R: 'static, E: 'static>(
        &mut self,
        method: &str,
        descriptor: RequestType<P, R, E>,
    ) -> RequestType<P, R, E> {
        let bound = descriptor.with_method(method);
        self.server.methods.insert(
            method.to_string(),
            MethodSpec {
                method: method.to_string(),
                kind: MethodKind::Request,
                optional: bound.is_optional(),
                types: bound.type_info(),
            },
        );
        bound
    }

    /// Add a notification to the server side; returns the bound clone.
    pub fn server_notification<P: 'static>(
        &mut self,
        method: &str,
        descriptor: NotificationType<P>,
    ) -> NotificationType<P> {
        let bound = descriptor.with_method(method);
        self.server.methods.insert(
            method.to_string(),
            MethodSpec {
                method: method.to_string(),
                kind: MethodKind::Notification,
                optional: false,
                types: bound.type_info(),
            },
        );
        bound
    }

    /// Add a request to the client side; returns the bound clone.
    pub fn client_request<P: 'static, R: 'static, E: 'static>(
        &mut self,
        method: &str,
        descriptor: RequestType<P, R, E>,
    ) -> RequestType<P, R, E> {
        let bound = descriptor.with_method(method);
        self.client.methods.insert(
            method.to_string(),
            MethodSpec {
                method: method.to_string(),
                kind: MethodKind::Request,
                optional: bound.is_optional(),
                types: bound.type_info(),
            },
        );
        bound
    }

    /// Add a notification to the client side; returns the bound clone.
    pub fn client_notification<P: 'static>(
        &mut self,
        method: &str,
        descriptor: NotificationType<P>,
    ) -> NotificationType<P> {
        let bound = descriptor.with_method(method);
        self.client.methods.insert(
            method.to_string(),
            MethodSpec {
                method: method.to_string(),
                kind: MethodKind::Notification,
                optional: false,
                types: bound.type_info(),
            },
        );
        bound
    }

    pub fn build(self) -> Contract {
        Contract {
            name: self.name,
            tags: self.tags,
            server: Arc::new(self.server),
            client: Arc::new(self.client),
        }
    }
}

/// An immutable pair of role interfaces.
///
/// The contract is context-agnostic: the same value instantiates against
/// typed channels of any context types (the no-op widening the runtime
/// supports).
#[derive(Clone)]
pub struct Contract {
    name: String,
    tags: Vec<String>,
    server: Arc<InterfaceSpec>,
    client: Arc<InterfaceSpec>,
}

impl Contract {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn server(&self) -> &InterfaceSpec {
        &self.server
    }

    pub fn client(&self) -> &InterfaceSpec {
        &self.client
    }

    /// Act as the server: install `handlers` for the server side and get
    /// a counterpart proxy for the client side.
    pub fn register_server<T, C, S>(
        &self,
        channel: &T,
        handlers: ContractHandlers<T, C, S>,
    ) -> Result<ContractInstance<T, C, S>, ContractError>
    where
        T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
        C: Send + 'static,
        S: Send + 'static,
    {
        self.instantiate(channel, &self.server, &self.client, handlers)
    }

    /// Act as the client: install `handlers` for the client side and get
    /// a counterpart proxy for the server side.
    pub fn get_server<T, C, S>(
        &self,
        channel: &T,
        handlers: ContractHandlers<T, C, S>,
    ) -> Result<ContractInstance<T, C, S>, ContractError>
    where
        T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
        C: Send + 'static,
        S: Send + 'static,
    {
        self.instantiate(channel, &self.client, &self.server, handlers)
    }

    /// Convenience: typed channel from `transport`, server handlers
    /// registered, channel started.
    pub fn register_server_over_transport<C, S>(
        &self,
        transport: Box<dyn MessageTransport>,
        handlers: ContractHandlers<TypedChannel<C, S>, C, S>,
        options: TypedChannelOptions,
    ) -> Result<(ContractInstance<TypedChannel<C, S>, C, S>, TypedChannel<C, S>), ContractError>
    where
        C: Clone + Default + Send + Sync + 'static,
        S: Send + 'static,
    {
        let channel: TypedChannel<C, S> =
            TypedChannel::new(StreamChannelFactory::new(transport), options);
        let instance = self.register_server(&channel, handlers)?;
        channel.start()?;
        Ok((instance, channel))
    }

    /// Convenience: typed channel from `transport`, client handlers
    /// registered, channel started.
    pub fn get_server_over_transport<C, S>(
        &self,
        transport: Box<dyn MessageTransport>,
        handlers: ContractHandlers<TypedChannel<C, S>, C, S>,
        options: TypedChannelOptions,
    ) -> Result<(ContractInstance<TypedChannel<C, S>, C, S>, TypedChannel<C, S>), ContractError>
    where
        C: Clone + Default + Send + Sync + 'static,
        S: Send + 'static,
    {
        let channel: TypedChannel<C, S> =
            TypedChannel::new(StreamChannelFactory::new(transport), options);
        let instance = self.get_server(&channel, handlers)?;
        channel.start()?;
        Ok((instance, channel))
    }

    fn instantiate<T, C, S>(
        &self,
        channel: &T,
        own: &Arc<InterfaceSpec>,
        peer: &Arc<InterfaceSpec>,
        handlers: ContractHandlers<T, C, S>,
    ) -> Result<ContractInstance<T, C, S>, ContractError>
    where
        T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
        C: Send + 'static,
        S: Send + 'static,
    {
        let cell: Arc<CounterpartCell<T, C, S>> = Arc::new(OnceLock::new());
        let registrations = Registrations::new();
        let mut provided: BTreeSet<String> = BTreeSet::new();

        let outcome: Result<(), ContractError> = (|| {
            for entry in handlers.entries {
                let method = entry
                    .method
                    .ok_or(RegistrationError::MissingMethodName)?;
                let spec = own.get(&method).ok_or_else(|| ContractError::UnknownMethod {
                    contract: self.name.clone(),
                    method: method.clone(),
                })?;
                if spec.kind != entry.kind {
                    return Err(RegistrationError::ConflictingKind(method).into());
                }
                let registration = (entry.installer)(channel, cell.clone())?;
                registrations.push(registration);
                provided.insert(method);
            }

            for spec in own.methods() {
                if spec.kind == MethodKind::Request && !provided.contains(&spec.method) {
                    return Err(ContractError::MissingRequestHandler {
                        contract: self.name.clone(),
                        method: spec.method.clone(),
                    });
                }
            }
            Ok(())
        })();

        if let Err(err) = outcome {
            // Leave nothing half-installed behind a failed instantiation.
            registrations.dispose();
            return Err(err);
        }

        let counterpart = Counterpart {
            channel: channel.clone(),
            side: peer.clone(),
            _marker: PhantomData,
        };
        let _ = cell.set(counterpart.clone());

        Ok(ContractInstance {
            counterpart,
            registrations,
        })
    }
}

type CounterpartCell<T, C, S> = OnceLock<Counterpart<T, C, S>>;

type Installer<T, C, S> = Box<
    dyn FnOnce(&T, Arc<CounterpartCell<T, C, S>>) -> Result<Registration, RegistrationError>
        + Send,
>;

struct HandlerEntry<T, C, S> {
    method: Option<String>,
    kind: MethodKind,
    installer: Installer<T, C, S>,
}

/// Collects the handler functions for one role of a contract.
pub struct ContractHandlers<T, C, S> {
    entries: Vec<HandlerEntry<T, C, S>>,
}

impl<T, C, S> Default for ContractHandlers<T, C, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C, S> ContractHandlers<T, C, S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T, C, S> ContractHandlers<T, C, S>
where
    T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
    C: Send + 'static,
    S: Send + 'static,
{
    /// Supply the handler for one of the role's request methods.
    ///
    /// The handler returns `Ok(result)` or a [`DomainError`]; the wrapper
    /// converts the error into the typed channel's domain-error response.
    pub fn on_request<P, R, E, F, Fut>(
        mut self,
        descriptor: &RequestType<P, R, E>,
        handler: F,
    ) -> Self
    where
        P: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(P, HandlerInfo<T, C, S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, DomainError<E>>> + Send + 'static,
    {
        let method = descriptor.method().map(str::to_string);
        let descriptor = descriptor.clone();
        let handler = Arc::new(handler);

        let installer: Installer<T, C, S> = Box::new(move |channel, cell| {
            channel.register_request(
                &descriptor,
                move |args: P, received: RequestContext<C>| {
                    let handler = handler.clone();
                    let cell = cell.clone();
                    let fut: BoxFuture<RequestHandlerResult<R, E>> = Box::pin(async move {
                        let info = HandlerInfo {
                            request_id: Some(received.request_id),
                            context: received.context,
                            counterpart: cell,
                        };
                        match handler(args, info).await {
                            Ok(result) => Ok(result),
                            Err(domain) => Err(HandlerError::Domain(domain)),
                        }
                    });
                    fut
                },
            )
        });

        self.entries.push(HandlerEntry {
            method,
            kind: MethodKind::Request,
            installer,
        });
        self
    }

    /// Supply a handler for one of the role's notification methods.
    /// Notifications without a handler are silently dropped.
    pub fn on_notification<P, F, Fut>(
        mut self,
        descriptor: &NotificationType<P>,
        handler: F,
    ) -> Self
    where
        P: Send + 'static,
        F: Fn(P, HandlerInfo<T, C, S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NotificationResult> + Send + 'static,
    {
        let method = descriptor.method().map(str::to_string);
        let descriptor = descriptor.clone();
        let handler = Arc::new(handler);

        let installer: Installer<T, C, S> = Box::new(move |channel, cell| {
            channel.register_notification(&descriptor, move |args: P, context: C| {
                let handler = handler.clone();
                let cell = cell.clone();
                let fut: BoxFuture<NotificationResult> = Box::pin(async move {
                    let info = HandlerInfo {
                        request_id: None,
                        context,
                        counterpart: cell,
                    };
                    handler(args, info).await
                });
                fut
            })
        });

        self.entries.push(HandlerEntry {
            method,
            kind: MethodKind::Notification,
            installer,
        });
        self
    }
}

/// Per-invocation record handed to contract handlers.
pub struct HandlerInfo<T, C, S> {
    /// The request id; `None` for notifications.
    pub request_id: Option<RequestId>,
    /// The channel's receive context.
    pub context: C,
    counterpart: Arc<CounterpartCell<T, C, S>>,
}

impl<T, C, S> HandlerInfo<T, C, S> {
    /// The proxy for the peer's side, for back-calls from within a
    /// handler.
    pub fn counterpart(&self) -> &Counterpart<T, C, S> {
        self.counterpart
            .get()
            .expect("counterpart is installed before any handler can run")
    }

    /// Start a domain error to return from the handler.
    pub fn error<E>(&self, message: impl Into<String>) -> DomainError<E> {
        DomainError::message(message)
    }
}

/// Caller proxy for the peer's side of a contract.
///
/// Invocations go through the typed channel; descriptors marked optional
/// get the optional-method fallback via
/// [`Counterpart::request_optional`].
pub struct Counterpart<T, C, S> {
    channel: T,
    side: Arc<InterfaceSpec>,
    _marker: PhantomData<fn(C, S)>,
}

impl<T, C, S> std::fmt::Debug for Counterpart<T, C, S>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counterpart")
            .field("channel", &self.channel)
            .field("side", &self.side)
            .finish()
    }
}

impl<T, C, S> Clone for Counterpart<T, C, S>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            side: self.side.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, C, S> Counterpart<T, C, S>
where
    T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
    C: Send + 'static,
    S: Send + 'static,
{
    /// The peer-side interface this proxy exposes.
    pub fn side(&self) -> &InterfaceSpec {
        &self.side
    }

    /// Call a request on the peer with an explicit send context.
    pub async fn request_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        context: S,
    ) -> Result<R, CallError<E>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        debug_assert!(
            descriptor.method().map(|m| self.side.contains(m)).unwrap_or(false),
            "descriptor is not part of the counterpart's interface"
        );
        self.channel.request_with(descriptor, args, context).await
    }

    /// Call an optional request; unknown methods resolve to `Ok(None)`.
    pub async fn request_optional_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        context: S,
    ) -> Result<Option<R>, CallError<E>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        debug_assert!(
            descriptor.method().map(|m| self.side.contains(m)).unwrap_or(false),
            "descriptor is not part of the counterpart's interface"
        );
        self.channel
            .request_optional_with(descriptor, args, context)
            .await
    }

    /// Send a notification to the peer with an explicit send context.
    pub async fn notify_with<P>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
        context: S,
    ) -> Result<(), CallError<()>>
    where
        P: Send + Sync + 'static,
    {
        debug_assert!(
            descriptor.method().map(|m| self.side.contains(m)).unwrap_or(false),
            "descriptor is not part of the counterpart's interface"
        );
        self.channel.notify_with(descriptor, args, context).await
    }
}

impl<T, C, S> Counterpart<T, C, S>
where
    T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
    C: Send + 'static,
    S: Default + Send + 'static,
{
    /// Call a request on the peer.
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
        self.request_with(descriptor, args, S::default()).await
    }

    /// Call an optional request on the peer.
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
        self.request_optional_with(descriptor, args, S::default())
            .await
    }

    /// Send a notification to the peer.
    pub async fn notify<P>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
    ) -> Result<(), CallError<()>>
    where
        P: Send + Sync + 'static,
    {
        self.notify_with(descriptor, args, S::default()).await
    }
}

/// What contract instantiation returns: the peer proxy and the aggregate
/// disposer over everything installed on the contract's behalf.
pub struct ContractInstance<T, C, S> {
    pub counterpart: Counterpart<T, C, S>,
    pub registrations: Registrations,
}

impl<T, C, S> std::fmt::Debug for ContractInstance<T, C, S>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractInstance")
            .field("counterpart", &self.counterpart)
            .field("registrations", &self.registrations)
            .finish()
    }
}

impl<T, C, S> ContractInstance<T, C, S> {
    /// Remove every handler this instantiation installed. Idempotent.
    pub fn dispose(&self) {
        self.registrations.dispose();
    }
}
