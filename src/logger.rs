//! Pluggable structured logging sink.
//!
//! Channels log diagnostics through [`RpcLogger`] instead of calling a
//! logging framework directly, so hosts can route entries wherever they
//! want. The default sink, [`TracingLogger`], forwards everything to
//! `tracing` events under the `peerwire` target.

use std::sync::Arc;

use serde_json::Value;

use crate::message::Message;

/// One structured log entry.
///
/// Borrowed: entries are built and consumed at the call site.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEntry<'a> {
    /// Human-readable text.
    pub text: &'a str,
    /// Optional structured payload.
    pub data: Option<&'a Value>,
    /// The message being processed, when the entry concerns one.
    pub message: Option<&'a Message>,
    /// Error text, when the entry reports a failure.
    pub error: Option<&'a str>,
}

impl<'a> LogEntry<'a> {
    /// Entry with just a text line.
    pub fn text(text: &'a str) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }

    /// Attach the message being processed.
    pub fn with_message(mut self, message: &'a Message) -> Self {
        self.message = Some(message);
        self
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: &'a Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach error text.
    pub fn with_error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }
}

/// Structured sink with the three channels the runtime uses.
pub trait RpcLogger: Send + Sync {
    /// Low-importance diagnostics (dropped messages, unknown ids).
    fn debug(&self, entry: LogEntry<'_>);
    /// Conditions an operator should see (handler failures, late starts).
    fn warn(&self, entry: LogEntry<'_>);
    /// Per-message tracing, used by the stream-logger wrapper.
    fn trace(&self, entry: LogEntry<'_>);
}

/// Default sink forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl RpcLogger for TracingLogger {
    fn debug(&self, entry: LogEntry<'_>) {
        tracing::debug!(
            target: "peerwire",
            data = ?entry.data,
            message = ?entry.message,
            error = entry.error,
            "{}",
            entry.text
        );
    }

    fn warn(&self, entry: LogEntry<'_>) {
        tracing::warn!(
            target: "peerwire",
            data = ?entry.data,
            message = ?entry.message,
            error = entry.error,
            "{}",
            entry.text
        );
    }

    fn trace(&self, entry: LogEntry<'_>) {
        tracing::trace!(
            target: "peerwire",
            data = ?entry.data,
            message = ?entry.message,
            error = entry.error,
            "{}",
            entry.text
        );
    }
}

/// The sink used when a channel is constructed without an explicit logger.
pub fn default_logger() -> Arc<dyn RpcLogger> {
    Arc::new(TracingLogger)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Collects entries so tests can assert on what was logged.
    #[derive(Default)]
    pub struct RecordingLogger {
        pub entries: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingLogger {
        pub fn texts(&self, channel: &str) -> Vec<String> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == channel)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    impl RpcLogger for RecordingLogger {
        fn debug(&self, entry: LogEntry<'_>) {
            self.entries
                .lock()
                .unwrap()
                .push(("debug", entry.text.to_string()));
        }

        fn warn(&self, entry: LogEntry<'_>) {
            self.entries
                .lock()
                .unwrap()
                .push(("warn", entry.text.to_string()));
        }

        fn trace(&self, entry: LogEntry<'_>) {
            self.entries
                .lock()
                .unwrap()
                .push(("trace", entry.text.to_string()));
        }
    }
}
