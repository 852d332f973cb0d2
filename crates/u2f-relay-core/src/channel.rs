//! In-memory duplex message channel.
//!
//! Mirrors a browser `MessageChannel`: two entangled ports, each able to post
//! JSON values to the other. Messages posted before the receiving side starts
//! reading are queued, so no explicit `start()` is needed.

use crate::error::{RelayError, RelayResult};
use serde_json::Value;
use tokio::sync::mpsc;

/// Factory for entangled [`MessagePort`] pairs.
pub struct MessageChannel;

impl MessageChannel {
    /// Create a new channel, returning its two ports.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MessagePort {
                tx: PortSender { tx: b_tx },
                rx: PortReceiver { rx: a_rx },
            },
            MessagePort {
                tx: PortSender { tx: a_tx },
                rx: PortReceiver { rx: b_rx },
            },
        )
    }
}

/// One end of a [`MessageChannel`].
#[derive(Debug)]
pub struct MessagePort {
    tx: PortSender,
    rx: PortReceiver,
}

impl MessagePort {
    /// Post a message to the entangled port.
    pub fn post_message(&self, message: Value) -> RelayResult<()> {
        self.tx.post_message(message)
    }

    /// Receive the next message. `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Split into independently owned sending and receiving halves.
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.tx, self.rx)
    }

    /// Close this port. The peer sees end-of-stream on its next `recv`.
    pub fn close(self) {
        drop(self);
    }
}

/// Sending half of a [`MessagePort`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl PortSender {
    /// Post a message to the entangled port.
    pub fn post_message(&self, message: Value) -> RelayResult<()> {
        self.tx
            .send(message)
            .map_err(|_| RelayError::Channel("message port closed".into()))
    }

    /// Whether the entangled port has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`MessagePort`].
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl PortReceiver {
    /// Receive the next message. `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}
