//! Interface between the flow-control layer and a streaming transport.
//!
//! A transport owns the wire. It pushes inbound messages into a
//! [`CallListener`], grants receive credit on request and reports write
//! readiness through a callback. Everything the adapter does to the call goes
//! through [`CallTransport`].

use std::sync::Arc;

use tonic::Status;

/// Readiness callback installed with [`CallTransport::set_ready_callback`].
///
/// Invoked whenever write readiness may have changed. Spurious invocations
/// are allowed; the adapter re-checks [`CallTransport::is_ready`].
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A single streaming call as seen from one side.
///
/// `In` is the type of messages received from the peer, `Out` the type of
/// messages sent to it.
pub trait CallTransport<In, Out>: Send + Sync + 'static {
    /// Register the listener that receives inbound events.
    ///
    /// Called exactly once, after the ready callback has been installed.
    fn start(&self, listener: Arc<dyn CallListener<In>>);

    /// Switch the call to manual credit management.
    fn disable_automatic_credit(&self);

    /// Grant the peer permission to send `count` more messages.
    fn request_credit(&self, count: u32);

    /// Install the readiness callback.
    fn set_ready_callback(&self, callback: ReadyCallback);

    /// Whether a write would be accepted without buffering.
    fn is_ready(&self) -> bool;

    /// Write one message to the peer.
    fn send_message(&self, message: Out) -> Result<(), Status>;

    /// Complete the outbound direction normally.
    fn half_close(&self);

    /// Complete the call with an error status (server role).
    fn close_with_error(&self, status: Status);

    /// Abort the call (client role, or any role on local cancellation).
    fn cancel(&self, status: Status);
}

/// Receiver of inbound events for one call.
///
/// Calls are serialized per call by the transport.
pub trait CallListener<In>: Send + Sync {
    /// A message arrived. Only sent against previously granted credit.
    fn deliver(&self, message: In);

    /// The call failed.
    fn on_error(&self, status: Status);

    /// The peer completed its outbound direction.
    fn on_completed(&self);

    /// The peer cancelled the call.
    fn on_cancel(&self);
}
