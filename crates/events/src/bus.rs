//! Projection hand-off abstraction (mechanics only).
//!
//! After a command commits, its event is handed to the projector through an
//! [`EventBus`]. The hand-off is fire-and-forget for the command, but it is
//! never silent: `publish` reports whether the message was accepted, so the
//! caller can log and count lost dispatches.
//!
//! ## Delivery
//!
//! - **At-most-once per publish**: a rejected publish is not retried here.
//! - **Recovery lives elsewhere**: events are stored before they are
//!   published, so a lost hand-off is repaired by re-reading the event log
//!   (catch-up or replay). Consumers must therefore be idempotent.
//! - **Ordering**: messages from one publisher arrive in publish order; no
//!   ordering is promised across concurrent publishers.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Receiving half of a bus.
///
/// Exactly one consumer owns a subscription; it is handed to the projection
/// worker at startup.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting new messages; already queued messages can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Publishing half of the hand-off between the write side and the projector.
///
/// `publish()` must never block: it runs right after a commit, on the
/// command's path, and the command's response must not wait on projection.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }
}
