//! Message-tracing transport wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{ConnectionState, MessageListener, MessageTransport};
use crate::error::TransportError;
use crate::logger::{LogEntry, RpcLogger};
use crate::message::Message;

/// Wraps a transport and traces every inbound and outbound message through
/// an [`RpcLogger`] without modifying them.
pub struct LoggingTransport {
    inner: Box<dyn MessageTransport>,
    logger: Arc<dyn RpcLogger>,
}

impl LoggingTransport {
    pub fn new(inner: Box<dyn MessageTransport>, logger: Arc<dyn RpcLogger>) -> Self {
        Self { inner, logger }
    }
}

#[async_trait]
impl MessageTransport for LoggingTransport {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.logger
            .trace(LogEntry::text("outgoing message").with_message(&message));
        self.inner.send(message).await
    }

    fn set_listener(&self, listener: MessageListener) {
        let logger = self.logger.clone();
        self.inner.set_listener(Arc::new(move |message| {
            logger.trace(LogEntry::text("incoming message").with_message(&message));
            listener(message);
        }));
    }

    fn description(&self) -> String {
        format!("logging({})", self.inner.description())
    }
}
