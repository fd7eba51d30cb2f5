//! Deployment channel abstraction.
//!
//! A channel delivers discrete [`DeployEvent`](crate::network::event::DeployEvent)s
//! from the remote peer through a bounded queue and offers the few outbound
//! operations the device needs: status texts, advertising control and
//! dropping the connection.

use crate::network::event::Envelope;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

/// Future returned by the [`DeploymentChannel`] operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The event receiver was already handed out.
    #[error("event receiver already consumed")]
    AlreadyConsumed,

    /// No peer is connected.
    #[error("no peer connected")]
    NotConnected,

    /// Writing to the peer failed.
    #[error("failed to send to peer: {0}")]
    SendFailed(String),

    /// The event queue has no consumer anymore.
    #[error("event queue closed")]
    QueueClosed,

    #[error("reply dropped before the event was handled")]
    NoReply,
}

/// Link to the remote deployment peer.
///
/// Methods take `self: &Arc<Self>` so implementations can move clones of
/// themselves into the returned futures.
pub trait DeploymentChannel: Send + Sync + 'static {
    /// Hands out the event receiver. Succeeds once.
    fn consume(self: &Arc<Self>) -> BoxFuture<'static, Result<Receiver<Envelope>, TransportError>>;

    /// MTU negotiated with the current peer.
    fn negotiated_mtu(self: &Arc<Self>) -> u16;

    /// Sends a status text to the connected peer.
    fn send_text(self: &Arc<Self>, text: String) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Makes the device discoverable under `name`.
    fn advertise(self: &Arc<Self>, name: String) -> BoxFuture<'static, Result<(), TransportError>>;

    fn stop_advertising(self: &Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Drops the current peer, if any.
    fn disconnect(self: &Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Takes the receiver out of a channel's slot, for [`DeploymentChannel::consume`].
pub(crate) fn take_receiver(
    slot: Arc<tokio::sync::Mutex<Option<Receiver<Envelope>>>>,
) -> BoxFuture<'static, Result<Receiver<Envelope>, TransportError>> {
    Box::pin(async move { slot.lock().await.take().ok_or(TransportError::AlreadyConsumed) })
}
