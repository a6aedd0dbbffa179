//! Owner of the transport for one call.
//!
//! Every credit request and every terminal signal goes through
//! [`CallHandle`]. Terminal signals are idempotent: however many paths
//! decide to cancel or close the call, the transport hears about it once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tonic::Status;
use tracing::{debug, trace};

use super::Role;
use crate::flow::credit::CreditControl;
use crate::flow::stats::FlowCounters;
use crate::transport::CallTransport;

pub struct CallHandle<In, Out> {
    transport: Arc<dyn CallTransport<In, Out>>,
    role: Role,
    counters: Arc<FlowCounters>,
    /// Half-closed or closed with an error.
    outbound_done: AtomicBool,
    cancelled: AtomicBool,
    /// The transport reported a terminal event (error, peer cancel, or call
    /// completion on the client side).
    remote_closed: AtomicBool,
}

impl<In, Out> CallHandle<In, Out>
where
    In: 'static,
    Out: 'static,
{
    pub fn new(
        transport: Arc<dyn CallTransport<In, Out>>,
        role: Role,
        counters: Arc<FlowCounters>,
    ) -> Self {
        Self {
            transport,
            role,
            counters,
            outbound_done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn transport(&self) -> &dyn CallTransport<In, Out> {
        self.transport.as_ref()
    }

    /// Whether no further writes can reach the peer.
    pub fn is_terminated(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.remote_closed.load(Ordering::SeqCst)
            || self.outbound_done.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_remote_closed(&self) {
        self.remote_closed.store(true, Ordering::SeqCst);
    }

    /// Write one message to the peer.
    pub fn send_message(&self, message: Out) -> Result<(), Status> {
        if self.is_terminated() {
            return Err(Status::failed_precondition("call already terminated"));
        }
        self.transport.send_message(message)?;
        self.counters.message_sent();
        Ok(())
    }

    /// Complete the outbound direction normally. Returns true the first time.
    pub fn half_close(&self) -> bool {
        if self.is_cancelled() || self.is_remote_closed() {
            return false;
        }
        if self.outbound_done.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(role = %self.role, "half-closing call");
        self.transport.half_close();
        true
    }

    /// Complete the call with an error status. Returns true the first time.
    pub fn close_with_error(&self, status: Status) -> bool {
        if self.is_cancelled() || self.is_remote_closed() {
            return false;
        }
        if self.outbound_done.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(role = %self.role, code = ?status.code(), message = status.message(), "closing call with error");
        self.transport.close_with_error(status);
        true
    }

    /// Cancel the call on the transport. Returns true the first time.
    ///
    /// A no-op once the transport reported a terminal event, or once a
    /// server has already closed the call.
    pub fn cancel(&self, status: Status) -> bool {
        if self.is_remote_closed() {
            return false;
        }
        if self.role == Role::Server && self.outbound_done.load(Ordering::SeqCst) {
            return false;
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(role = %self.role, code = ?status.code(), message = status.message(), "cancelling call");
        self.transport.cancel(status);
        true
    }

    /// Terminate the call with a failure, the way the role requires.
    ///
    /// Clients cancel; servers close the call with the status.
    pub fn fail(&self, status: Status) -> bool {
        match self.role {
            Role::Client => self.cancel(status),
            Role::Server => self.close_with_error(status),
        }
    }
}

impl<In, Out> CreditControl for CallHandle<In, Out>
where
    In: 'static,
    Out: 'static,
{
    fn request_credit(&self, count: u32) {
        if self.is_cancelled() || self.is_remote_closed() {
            trace!(count, "call terminated, credit request skipped");
            return;
        }
        trace!(role = %self.role, count, "requesting credit");
        self.counters.credit_requested(count);
        self.transport.request_credit(count);
    }

    fn is_ready(&self) -> bool {
        self.transport.is_ready()
    }
}
