//! Transport contract and shared transport building blocks.
//!
//! A transport is a duplex channel of whole JSON-RPC messages with a
//! connection-state signal. The core consumes the [`MessageTransport`]
//! trait; concrete network transports (WebSocket, framed byte streams,
//! worker message ports) live outside this crate. What this module ships:
//!
//! - [`ConnectionState`] and [`ConnectionStateSource`] - the monotonic
//!   state observable every transport owns
//! - [`ListenerSlot`] - a buffered single-slot listener with the
//!   synchronous, reentrant drain the contract requires
//! - [`pair`] - two linked in-memory endpoints for tests and demos
//! - [`LoggingTransport`] - traces all traffic without modifying it

mod logging;
mod pair;

pub use logging::LoggingTransport;
pub use pair::{pair, PairTransport};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::message::Message;

/// Connection lifecycle of a transport.
///
/// Transitions are monotonic: `Connecting → Open`, `Connecting → Closed`,
/// `Open → Closed`. A closed transport never reopens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed {
        /// Present when the transport closed because of a failure.
        error: Option<String>,
    },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed { .. })
    }
}

/// Owner side of the connection-state observable.
///
/// Transports hold the source; channels and applications subscribe through
/// [`ConnectionStateSource::subscribe`]. Invalid transitions are ignored,
/// which keeps the published state monotonic no matter how callers race.
#[derive(Debug)]
pub struct ConnectionStateSource {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateSource {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current state snapshot.
    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    /// New receiver observing the current value and all future changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// `Connecting → Open`. Returns `false` if the transition was invalid.
    pub fn set_open(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Connecting) {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Transition to `Closed`. Returns `false` if already closed.
    pub fn set_closed(&self, error: Option<String>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = ConnectionState::Closed { error };
                true
            }
        })
    }
}

impl Default for ConnectionStateSource {
    fn default() -> Self {
        Self::new(ConnectionState::Connecting)
    }
}

/// Inbound message listener installed on a transport.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

/// A duplex channel of framed JSON-RPC messages.
///
/// Contract: messages are delivered to the listener in the order they were
/// observed on the wire; inbound messages arriving before a listener is
/// installed are buffered and drained synchronously when one is installed;
/// closing is terminal.
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// The connection-state observable, re-exported unchanged by channels.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Hand a message to the underlying channel. Resolves once accepted;
    /// failure surfaces as an error.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Install the single inbound listener, replacing any previous one.
    /// Buffered messages are delivered before this returns.
    fn set_listener(&self, listener: MessageListener);

    /// Human-readable identifier for diagnostics.
    fn description(&self) -> String;
}

struct SlotState {
    listener: Option<MessageListener>,
    buffer: VecDeque<Message>,
    draining: bool,
}

/// Buffered single-slot listener.
///
/// Embed one in a transport to get the delivery contract for free:
/// messages pushed through [`ListenerSlot::deliver`] before a listener is
/// installed are buffered; [`ListenerSlot::install`] drains the buffer
/// synchronously before returning. The drain loop re-reads the installed
/// listener on every iteration, so a listener may install or replace the
/// listener from within its own invocation and drainage continues with the
/// new one.
pub struct ListenerSlot {
    state: Mutex<SlotState>,
}

impl ListenerSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                listener: None,
                buffer: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Install or replace the listener, draining buffered messages.
    pub fn install(&self, listener: MessageListener) {
        let mut guard = self.state.lock().unwrap();
        guard.listener = Some(listener);
        self.drain(guard);
    }

    /// Deliver a message: directly when a listener is installed, buffered
    /// otherwise.
    pub fn deliver(&self, message: Message) {
        let mut guard = self.state.lock().unwrap();
        guard.buffer.push_back(message);
        self.drain(guard);
    }

    /// Number of messages waiting for a listener.
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    fn drain<'a>(&'a self, mut guard: std::sync::MutexGuard<'a, SlotState>) {
        // A drain is already running further up the stack; it will pick up
        // whatever we just changed.
        if guard.draining {
            return;
        }
        guard.draining = true;
        loop {
            let listener = match &guard.listener {
                Some(listener) if !guard.buffer.is_empty() => Arc::clone(listener),
                _ => break,
            };
            let message = match guard.buffer.pop_front() {
                Some(message) => message,
                None => break,
            };
            // The listener runs unlocked so it may send, install a new
            // listener, or deliver more messages without deadlocking.
            drop(guard);
            listener(message);
            guard = self.state.lock().unwrap();
        }
        guard.draining = false;
    }
}

impl Default for ListenerSlot {
    fn default() -> Self {
        Self::new()
    }
}
