//! Completion and cancellation wiring between a transport, the two queues and
//! the call's scope.
//!
//! Edges:
//! - transport error: both queues fail with the status, readiness waits fail
//! - transport completion: inbound coordinator decides when to close
//! - outbound queue closed by the application: drain then half-close, or
//!   terminate the call on a failed close
//! - peer cancellation: the scope is cancelled, unblocking every local waiter
//! - local scope cancellation (explicit, deadline, handler failure): the
//!   transport is cancelled exactly once

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, trace, warn};

use crate::call::{CallHandle, Role};
use crate::error::{DEADLINE_ELAPSED, LOCAL_CANCELLED, PEER_CANCELLED};
use crate::flow::ready::ReadyTracker;
use crate::flow::stats::FlowCounters;
use crate::flow::{InboundSide, Spawner};
use crate::observability::metrics;
use crate::queue::{BoundedQueue, Termination, TryRecv};
use crate::transport::CallListener;

/// Which side initiated a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// The remote peer cancelled the call.
    Peer,
    /// Cancelled on this side: explicitly, by deadline or by a failure.
    Local,
}

impl CancelOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Local => "local",
        }
    }
}

/// Execution scope of one call.
///
/// Cancelling the scope tears the call down. The first recorded cause wins.
#[derive(Debug, Default)]
pub struct CallScope {
    token: CancellationToken,
    cause: OnceLock<(CancelOrigin, Status)>,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that is also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: OnceLock::new(),
        }
    }

    /// Cancel the scope. Returns true if this call recorded the cause.
    pub fn cancel(&self, origin: CancelOrigin, status: Status) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let first = self.cause.set((origin, status)).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Origin and status of the cancellation, if one was recorded.
    pub fn cause(&self) -> Option<(CancelOrigin, Status)> {
        self.cause.get().cloned()
    }

    /// The status waiters should fail with, once cancelled.
    pub fn status(&self) -> Option<Status> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(
            self.cause
                .get()
                .map_or_else(|| Status::cancelled(LOCAL_CANCELLED), |(_, status)| status.clone()),
        )
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Terminal-signal wiring for one call.
pub(crate) struct Bridge<In, Out> {
    handle: Arc<CallHandle<In, Out>>,
    scope: Arc<CallScope>,
    inbound: Arc<dyn InboundSide<In>>,
    outbound: Arc<BoundedQueue<Out>>,
    ready: Arc<ReadyTracker>,
    counters: Arc<FlowCounters>,
    pump_finished: CancellationToken,
}

impl<In, Out> Bridge<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(
        handle: Arc<CallHandle<In, Out>>,
        scope: Arc<CallScope>,
        inbound: Arc<dyn InboundSide<In>>,
        outbound: Arc<BoundedQueue<Out>>,
        ready: Arc<ReadyTracker>,
        counters: Arc<FlowCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            scope,
            inbound,
            outbound,
            ready,
            counters,
            pump_finished: CancellationToken::new(),
        })
    }

    /// Hook the bridge into the transport and start the call's watchers.
    ///
    /// The transport only ever sees weak references to the bridge; the
    /// spawned watchers keep it alive until the call settles or is torn
    /// down.
    pub(crate) fn start(self: &Arc<Self>, spawner: &Spawner, deadline: Option<Duration>) {
        let transport = self.handle.transport();
        transport.disable_automatic_credit();

        let weak = Arc::downgrade(self);
        transport.set_ready_callback(Arc::new(move || {
            if let Some(bridge) = weak.upgrade() {
                bridge.on_ready();
            }
        }));

        transport.start(Arc::new(Listener {
            bridge: Arc::downgrade(self),
            counters: self.counters.clone(),
        }));

        spawner.spawn(self.clone().pump_outbound());
        spawner.spawn(self.clone().supervise(deadline));
    }

    fn on_ready(&self) {
        self.ready.signal();
        self.inbound.on_ready();
    }

    fn on_error(&self, status: Status) {
        debug!(
            role = %self.handle.role(),
            code = ?status.code(),
            message = status.message(),
            "transport reported error"
        );
        self.handle.mark_remote_closed();
        self.inbound
            .queue()
            .close(Termination::Failed(status.clone()));
        self.outbound.cancel(status.clone());
        self.ready.cancel(status);
    }

    fn on_completed(&self) {
        debug!(role = %self.handle.role(), "transport completed inbound direction");
        if self.handle.role() == Role::Client {
            // The server has sent its final status; the call is over.
            self.handle.mark_remote_closed();
        }
        self.inbound.on_upstream_completed();
    }

    fn on_cancel(&self) {
        debug!(role = %self.handle.role(), "peer cancelled call");
        self.handle.mark_remote_closed();
        self.scope
            .cancel(CancelOrigin::Peer, Status::cancelled(PEER_CANCELLED));
    }

    /// Move outbound values to the transport, one per readiness.
    async fn pump_outbound(self: Arc<Self>) {
        loop {
            self.outbound.readable().await;
            if !self.outbound.is_closed_for_receive() {
                if let Err(status) = self.ready.await_ready().await {
                    trace!(code = ?status.code(), "readiness wait ended, stopping outbound pump");
                    break;
                }
            }

            match self.outbound.try_recv() {
                TryRecv::Item(message) => {
                    if let Err(status) = self.handle.send_message(message) {
                        warn!(code = ?status.code(), message = status.message(), "outbound write failed");
                        self.outbound.cancel(status.clone());
                        if !self.handle.is_remote_closed() {
                            self.scope.cancel(CancelOrigin::Local, status);
                        }
                        break;
                    }
                }
                TryRecv::Empty => {}
                TryRecv::Closed(Termination::Completed) => {
                    // A cancelled call is terminated by tear-down, never
                    // completed normally.
                    if self.scope.is_cancelled() {
                        trace!("outbound closed after cancellation, not half-closing");
                    } else {
                        self.handle.half_close();
                    }
                    break;
                }
                TryRecv::Closed(Termination::Failed(status)) => {
                    if !self.handle.is_remote_closed() {
                        self.scope.cancel(CancelOrigin::Local, status);
                    }
                    break;
                }
            }
        }
        self.pump_finished.cancel();
    }

    /// Wait for the call to settle, be cancelled or run past its deadline.
    async fn supervise(self: Arc<Self>, deadline: Option<Duration>) {
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.scope.cancelled() => {}
            () = expired => {
                debug!(role = %self.handle.role(), ?deadline, "call deadline elapsed");
                self.scope.cancel(
                    CancelOrigin::Local,
                    Status::deadline_exceeded(DEADLINE_ELAPSED),
                );
            }
            () = self.settled() => {
                // A failed outbound close cancels the scope before the pump
                // finishes.
                if !self.scope.is_cancelled() {
                    trace!(role = %self.handle.role(), "call settled");
                    return;
                }
            }
        }
        self.tear_down();
    }

    /// Both directions reached a terminal state on their own.
    async fn settled(&self) {
        let _ = tokio::join!(self.inbound.queue().closed(), self.pump_finished.cancelled());
    }

    fn tear_down(&self) {
        let (origin, status) = self
            .scope
            .cause()
            .unwrap_or_else(|| (CancelOrigin::Local, Status::cancelled(LOCAL_CANCELLED)));
        debug!(
            role = %self.handle.role(),
            origin = origin.as_str(),
            code = ?status.code(),
            message = status.message(),
            "tearing down call"
        );
        metrics::record_cancellation(self.counters.role(), origin.as_str());

        self.ready.cancel(status.clone());
        self.inbound.queue().cancel(status.clone());
        self.outbound.cancel(status.clone());
        if origin == CancelOrigin::Local {
            self.handle.fail(status);
        }
    }
}

/// What the transport holds on to.
struct Listener<In, Out> {
    bridge: Weak<Bridge<In, Out>>,
    counters: Arc<FlowCounters>,
}

impl<In, Out> CallListener<In> for Listener<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn deliver(&self, message: In) {
        self.counters.message_received();
        match self.bridge.upgrade() {
            Some(bridge) => bridge.inbound.on_value(message),
            None => {
                self.counters.late_delivery();
                trace!("call already released, dropping delivery");
            }
        }
    }

    fn on_error(&self, status: Status) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_error(status);
        }
    }

    fn on_completed(&self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_completed();
        }
    }

    fn on_cancel(&self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_cancel();
        }
    }
}
