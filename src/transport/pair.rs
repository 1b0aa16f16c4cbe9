//! In-memory linked transport pair.
//!
//! [`pair`] returns two endpoints wired back to back: whatever one sends,
//! the other's listener receives. Used by the test suite and by demos that
//! run both peers in one process; real deployments plug in a network
//! transport instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::watch;

use super::{ConnectionState, ConnectionStateSource, ListenerSlot, MessageListener, MessageTransport};
use crate::error::TransportError;
use crate::message::Message;

static PAIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One endpoint of an in-memory transport pair.
pub struct PairTransport {
    name: String,
    out_tx: mpsc::UnboundedSender<Message>,
    state: Arc<ConnectionStateSource>,
    peer_state: Arc<ConnectionStateSource>,
    slot: Arc<ListenerSlot>,
}

/// Create two linked endpoints. Both start `Open`.
pub fn pair() -> (PairTransport, PairTransport) {
    let n = PAIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a_state = Arc::new(ConnectionStateSource::new(ConnectionState::Open));
    let b_state = Arc::new(ConnectionStateSource::new(ConnectionState::Open));

    let a = PairTransport::new(format!("pair-{}-a", n), b_tx, a_state.clone(), b_state.clone(), a_rx);
    let b = PairTransport::new(format!("pair-{}-b", n), a_tx, b_state, a_state, b_rx);
    (a, b)
}

impl PairTransport {
    fn new(
        name: String,
        out_tx: mpsc::UnboundedSender<Message>,
        state: Arc<ConnectionStateSource>,
        peer_state: Arc<ConnectionStateSource>,
        mut in_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        let slot = Arc::new(ListenerSlot::new());

        // Pump inbound messages into the slot in arrival order. Ends when
        // the peer endpoint is dropped.
        let pump_slot = slot.clone();
        tokio::spawn(async move {
            while let Some(message) = in_rx.recv().await {
                pump_slot.deliver(message);
            }
        });

        Self {
            name,
            out_tx,
            state,
            peer_state,
            slot,
        }
    }

    /// Close both endpoints. Terminal; sends fail afterwards.
    pub fn close(&self) {
        self.state.set_closed(None);
        self.peer_state.set_closed(None);
    }
}

#[async_trait]
impl MessageTransport for PairTransport {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.state.current().is_closed() {
            return Err(TransportError::Closed);
        }
        self.out_tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn set_listener(&self, listener: MessageListener) {
        self.slot.install(listener);
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}
