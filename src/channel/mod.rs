//! Asynchronous, message-only channel between two execution contexts.
//!
//! A channel is a pair of [`Port`]s. Each port posts frames to the other and
//! receives the other's frames; the two sides share nothing but a teardown
//! token, so closing either port ends the channel for both.
//!
//! Delivery is best-effort from the point of view of the components built on
//! top: they never assume ordering between requests and responses, and they
//! treat duplicates and unknown ids as noise.

pub mod stream;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

/// One event observed on a port.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A frame posted by the peer.
    Message(Value),
    /// A frame arrived but could not be deserialized.
    Error(String),
}

/// Create two connected ports.
pub fn pair() -> (Port, Port) {
    let closed = CancellationToken::new();
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Port::new(a_tx, a_rx, closed.clone()),
        Port::new(b_tx, b_rx, closed),
    )
}

/// One end of a channel.
#[derive(Debug)]
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

impl Port {
    fn new(
        tx: mpsc::UnboundedSender<ChannelEvent>,
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            sender: PortSender {
                tx,
                closed: closed.clone(),
            },
            receiver: PortReceiver { rx, closed },
        }
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Posting half of a port. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    closed: CancellationToken,
}

impl PortSender {
    /// Post one frame to the peer.
    pub fn post(&self, frame: Value) -> Result<()> {
        self.post_event(ChannelEvent::Message(frame))
    }

    pub(crate) fn post_event(&self, event: ChannelEvent) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::channel_closed("channel is closed"));
        }
        self.tx
            .send(event)
            .map_err(|_| Error::send("peer is no longer receiving"))
    }

    /// Tear down the channel for both sides.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    closed: CancellationToken,
}

impl PortReceiver {
    /// Next event from the peer. Frames posted before the channel closed are
    /// still delivered; `None` once those are drained or the peer dropped its
    /// sender.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.closed.is_cancelled() {
            return self.rx.try_recv().ok();
        }
        tokio::select! {
            biased;
            event = self.rx.recv() => event,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}
