//! Push handle for an open websocket connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Returned when pushing to a connection that has already closed.
#[derive(Debug, thiserror::Error)]
#[error("websocket connection {0} is closed")]
pub struct ChannelClosed(pub Uuid);

/// Sending half of one websocket connection's outbound queue.
///
/// Every outbound frame for the connection goes through this queue, whether it
/// answers a submission or was pushed by executed code, so frames leave in the
/// order they were produced. Holding a `LiveChannel` does not keep the
/// connection open: once [`LiveChannel::close`] is called or the writer side
/// goes away, pushes fail.
#[derive(Debug, Clone)]
pub struct LiveChannel {
    id: Uuid,
    sender: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

impl LiveChannel {
    /// Create a channel in the open state along with its outbound queue.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            id: Uuid::new_v4(),
            sender,
            open: Arc::new(AtomicBool::new(true)),
        };
        (channel, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Queue one text frame for delivery.
    pub fn push(&self, text: String) -> Result<(), ChannelClosed> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ChannelClosed(self.id));
        }
        self.sender.send(text).map_err(|_| ChannelClosed(self.id))
    }

    /// Mark the connection closed for every clone of this handle.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}
