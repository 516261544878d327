//! In-process bounded channel bus.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelBusError {
    /// The queue is at capacity; the consumer is falling behind.
    #[error("projection queue is full")]
    Full,
    /// The consumer has shut down.
    #[error("projection queue is closed")]
    Closed,
}

/// Bounded in-process queue with a single consumer.
///
/// - No IO
/// - Non-blocking publish (`try_send`)
/// - Rejections are reported, never dropped silently
#[derive(Debug)]
pub struct ChannelBus<M> {
    sender: mpsc::Sender<M>,
}

impl<M> Clone for ChannelBus<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M> ChannelBus<M> {
    /// Create a bus holding at most `capacity` undelivered messages.
    pub fn bounded(capacity: usize) -> (Self, Subscription<M>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, Subscription::new(receiver))
    }

    /// Whether the consuming side is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<M> EventBus<M> for ChannelBus<M>
where
    M: Send + 'static,
{
    type Error = ChannelBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ChannelBusError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelBusError::Closed,
        })
    }
}
