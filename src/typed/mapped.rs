//! Context remapping for typed channels.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{
    BoxFuture, NotificationResult, RegisteredMethod, Registration, RequestContext,
    RequestHandlerResult, TypedRpc,
};
use crate::error::{CallError, RegistrationError};
use crate::types::{NotificationType, RequestType};

type RecvMap<C, C2> = Arc<dyn Fn(C) -> BoxFuture<C2> + Send + Sync>;
type SendMap<S2, S> = Arc<dyn Fn(S2) -> BoxFuture<S> + Send + Sync>;

/// Wraps a [`TypedRpc<C, S>`] to expose it as a [`TypedRpc<C2, S2>`].
///
/// The receive conversion runs on each inbound dispatch before the
/// wrapped handler sees its context; the send conversion runs on each
/// outgoing request or notification. Both conversions are asynchronous.
///
/// # Example
///
/// ```ignore
/// // Hand handlers a session looked up from the raw connection id.
/// let mapped = MappedChannel::new(
///     channel,
///     |conn_id| async move { sessions.lookup(conn_id).await },
///     |ctx: SendCtx| async move { ctx.into_raw() },
/// );
/// ```
pub struct MappedChannel<T, C, S, C2, S2> {
    inner: T,
    map_recv: RecvMap<C, C2>,
    map_send: SendMap<S2, S>,
    _marker: PhantomData<fn(C, S, C2, S2)>,
}

impl<T, C, S, C2, S2> Clone for MappedChannel<T, C, S, C2, S2>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            map_recv: self.map_recv.clone(),
            map_send: self.map_send.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, C, S, C2, S2> MappedChannel<T, C, S, C2, S2>
where
    T: TypedRpc<C, S>,
    C: Send + 'static,
    S: Send + 'static,
    C2: Send + 'static,
    S2: Send + 'static,
{
    pub fn new<FR, FutR, FS, FutS>(inner: T, map_recv: FR, map_send: FS) -> Self
    where
        FR: Fn(C) -> FutR + Send + Sync + 'static,
        FutR: Future<Output = C2> + Send + 'static,
        FS: Fn(S2) -> FutS + Send + Sync + 'static,
        FutS: Future<Output = S> + Send + 'static,
    {
        Self {
            inner,
            map_recv: Arc::new(move |context| Box::pin(map_recv(context))),
            map_send: Arc::new(move |context| Box::pin(map_send(context))),
            _marker: PhantomData,
        }
    }

    /// The wrapped channel.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T, C, S, C2, S2> TypedRpc<C2, S2> for MappedChannel<T, C, S, C2, S2>
where
    T: TypedRpc<C, S> + Clone + Send + Sync + 'static,
    C: Send + 'static,
    S: Send + 'static,
    C2: Send + 'static,
    S2: Send + 'static,
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
        F: Fn(P, RequestContext<C2>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RequestHandlerResult<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let map_recv = self.map_recv.clone();
        self.inner.register_request(
            descriptor,
            move |args: P, received: RequestContext<C>| {
                let handler = handler.clone();
                let map_recv = map_recv.clone();
                let fut: BoxFuture<RequestHandlerResult<R, E>> = Box::pin(async move {
                    let context = map_recv(received.context).await;
                    handler(
                        args,
                        RequestContext {
                            request_id: received.request_id,
                            context,
                        },
                    )
                    .await
                });
                fut
            },
        )
    }

    fn register_notification<P, F, Fut>(
        &self,
        descriptor: &NotificationType<P>,
        handler: F,
    ) -> Result<Registration, RegistrationError>
    where
        P: Send + 'static,
        F: Fn(P, C2) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NotificationResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let map_recv = self.map_recv.clone();
        self.inner
            .register_notification(descriptor, move |args: P, received: C| {
                let handler = handler.clone();
                let map_recv = map_recv.clone();
                let fut: BoxFuture<NotificationResult> = Box::pin(async move {
                    let context = map_recv(received).await;
                    handler(args, context).await
                });
                fut
            })
    }

    fn request_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        context: S2,
    ) -> BoxFuture<Result<R, CallError<E>>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let inner = self.inner.clone();
        let map_send = self.map_send.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let context = map_send(context).await;
            inner.request_with(&descriptor, args, context).await
        })
    }

    fn request_optional_with<P, R, E>(
        &self,
        descriptor: &RequestType<P, R, E>,
        args: P,
        context: S2,
    ) -> BoxFuture<Result<Option<R>, CallError<E>>>
    where
        P: Send + Sync + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let inner = self.inner.clone();
        let map_send = self.map_send.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let context = map_send(context).await;
            inner.request_optional_with(&descriptor, args, context).await
        })
    }

    fn notify_with<P>(
        &self,
        descriptor: &NotificationType<P>,
        args: P,
        context: S2,
    ) -> BoxFuture<Result<(), CallError<()>>>
    where
        P: Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let map_send = self.map_send.clone();
        let descriptor = descriptor.clone();
        Box::pin(async move {
            let context = map_send(context).await;
            inner.notify_with(&descriptor, args, context).await
        })
    }

    fn registered_methods(&self) -> Vec<RegisteredMethod> {
        self.inner.registered_methods()
    }
}
