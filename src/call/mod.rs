//! Call assembly.
//!
//! [`CallBuilder`] turns a transport into a ready-to-use call:
//!
//! - [`CallBuilder::bidi`]: both directions as an [`InboundStream`] and an
//!   [`OutboundSink`]
//! - [`CallBuilder::serve_bidi`]: a server call driven by a handler future
//! - [`CallBuilder::response_stream`]: a single request followed by a
//!   credit-paced stream of responses
//! - [`CallBuilder::client_streaming`] and [`CallBuilder::unary`]: requests
//!   followed by a single response
//! - [`CallBuilder::serve_unary`], [`CallBuilder::serve_client_streaming`]
//!   and [`CallBuilder::serve_server_streaming`]: server handlers for the
//!   other call shapes, run on top of `serve_bidi`
//!
//! Building a call must happen inside a tokio runtime. The call's background
//! work runs on that runtime.

mod handle;
mod single;
mod stream;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

pub use handle::CallHandle;
pub use single::{
    client_streaming, serve_client_streaming, serve_server_streaming, serve_unary, unary,
    ClientStreamingCall, SingleResponse,
};
pub use stream::{InboundStream, OutboundSink};

use crate::bridge::{Bridge, CallScope, CancelOrigin};
use crate::config::FlowConfig;
use crate::error::{to_status, BoxError, QueueError, LOCAL_CANCELLED};
use crate::flow::credit::CreditControl;
use crate::flow::inbound::InboundFlow;
use crate::flow::preload::PreloadFlow;
use crate::flow::ready::ReadyTracker;
use crate::flow::stats::{FlowCounters, FlowStats};
use crate::flow::{InboundSide, Spawner};
use crate::queue::{BoundedQueue, Termination};
use crate::transport::CallTransport;

/// Which end of the call this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation and bookkeeping for a running call. Cheap to clone.
#[derive(Clone)]
pub struct CallControl {
    role: Role,
    scope: Arc<CallScope>,
    counters: Arc<FlowCounters>,
    spawner: Spawner,
}

impl CallControl {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Cancel the call. Repeated calls have no further effect.
    pub fn cancel(&self) {
        self.scope
            .cancel(CancelOrigin::Local, Status::cancelled(LOCAL_CANCELLED));
    }

    /// Fail the call with `err`, translated by [`to_status`].
    pub fn fail<E>(&self, err: E)
    where
        E: Into<BoxError>,
    {
        self.scope.cancel(CancelOrigin::Local, to_status(err));
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// The status the call was cancelled with, if it was.
    pub fn cancel_status(&self) -> Option<Status> {
        self.scope.status()
    }

    /// Whether the cancellation came from the peer.
    pub fn cancelled_by_peer(&self) -> bool {
        matches!(self.scope.cause(), Some((CancelOrigin::Peer, _)))
    }

    /// Wait until the call is cancelled.
    pub async fn cancelled(&self) {
        self.scope.cancelled().await;
    }

    pub fn stats(&self) -> FlowStats {
        self.counters.snapshot()
    }

    /// Wait for the call's background tasks to finish.
    pub async fn join(&self) {
        let tasks = self.spawner.tracker();
        tasks.close();
        tasks.wait().await;
    }
}

impl fmt::Debug for CallControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallControl")
            .field("role", &self.role)
            .field("cancelled", &self.scope.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A bidirectional streaming call.
pub struct BidiCall<In, Out> {
    inbound: InboundStream<In>,
    outbound: OutboundSink<Out>,
    control: CallControl,
}

impl<In, Out> BidiCall<In, Out> {
    /// Receive the next inbound message.
    pub async fn recv(&mut self) -> Result<Option<In>, Status> {
        self.inbound.recv().await
    }

    /// Queue an outbound message.
    pub async fn send(&self, message: Out) -> Result<(), QueueError> {
        self.outbound.send(message).await
    }

    pub fn inbound(&mut self) -> &mut InboundStream<In> {
        &mut self.inbound
    }

    pub fn outbound(&self) -> &OutboundSink<Out> {
        &self.outbound
    }

    pub fn control(&self) -> &CallControl {
        &self.control
    }

    pub fn split(self) -> (InboundStream<In>, OutboundSink<Out>, CallControl) {
        (self.inbound, self.outbound, self.control)
    }
}

/// Responses of a server-streaming call.
pub struct ResponseStream<In> {
    inbound: InboundStream<In>,
    control: CallControl,
}

impl<In> ResponseStream<In> {
    pub async fn recv(&mut self) -> Result<Option<In>, Status> {
        self.inbound.recv().await
    }

    pub fn control(&self) -> &CallControl {
        &self.control
    }

    /// Stop reading; cancels the call if the server is still sending.
    pub fn cancel(&mut self) {
        self.inbound.cancel();
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<In, Status>> + Send + 'static
    where
        In: Send + 'static,
    {
        self.inbound.into_stream()
    }

    pub fn into_parts(self) -> (InboundStream<In>, CallControl) {
        (self.inbound, self.control)
    }
}

/// Shared pieces of a call under construction.
struct CallParts<In, Out> {
    role: Role,
    handle: Arc<CallHandle<In, Out>>,
    control: Arc<dyn CreditControl>,
    scope: Arc<CallScope>,
    counters: Arc<FlowCounters>,
    spawner: Spawner,
}

impl<In, Out> CallParts<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn credit_control(&self) -> Weak<dyn CreditControl> {
        Arc::downgrade(&self.control)
    }

    fn call_control(&self) -> CallControl {
        CallControl {
            role: self.role,
            scope: self.scope.clone(),
            counters: self.counters.clone(),
            spawner: self.spawner.clone(),
        }
    }

    fn start(
        &self,
        inbound: Arc<dyn InboundSide<In>>,
        outbound: Arc<BoundedQueue<Out>>,
        config: &FlowConfig,
    ) {
        let ready = Arc::new(ReadyTracker::new(self.credit_control()));
        let bridge = Bridge::new(
            self.handle.clone(),
            self.scope.clone(),
            inbound,
            outbound,
            ready,
            self.counters.clone(),
        );
        bridge.start(&self.spawner, config.deadline_duration());
    }
}

/// Builds calls on top of a transport.
#[derive(Debug, Clone)]
pub struct CallBuilder {
    role: Role,
    config: FlowConfig,
    parent: Option<CancellationToken>,
}

impl CallBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: FlowConfig::default(),
            parent: None,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    #[must_use]
    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancel the call when `token` is cancelled (for example on shutdown).
    #[must_use]
    pub fn parent(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    fn parts<In, Out>(&self, transport: Arc<dyn CallTransport<In, Out>>) -> CallParts<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let counters = Arc::new(FlowCounters::new(self.role.as_str()));
        let handle = Arc::new(CallHandle::new(transport, self.role, counters.clone()));
        let control: Arc<dyn CreditControl> = handle.clone();
        let scope = Arc::new(match &self.parent {
            Some(parent) => CallScope::child_of(parent),
            None => CallScope::new(),
        });
        CallParts {
            role: self.role,
            handle,
            control,
            scope,
            counters,
            spawner: Spawner::current(),
        }
    }

    /// Start a bidirectional call.
    ///
    /// Inbound credit is requested one message at a time as the consumer
    /// makes room; outbound messages are written one per readiness signal.
    #[tracing::instrument(skip_all, fields(role = %self.role))]
    pub fn bidi<In, Out, T>(self, transport: Arc<T>) -> BidiCall<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
    {
        let parts = self.parts::<In, Out>(transport);
        let inbound_queue = BoundedQueue::new(self.config.inbound_capacity);
        let outbound_queue = BoundedQueue::new(self.config.outbound_capacity);

        let inbound = InboundFlow::new(
            inbound_queue.clone(),
            parts.credit_control(),
            parts.spawner.clone(),
            parts.counters.clone(),
        );
        parts.start(inbound, outbound_queue.clone(), &self.config);
        parts.handle.request_credit(1);

        debug!(
            inbound_capacity = inbound_queue.capacity(),
            outbound_capacity = outbound_queue.capacity(),
            deadline_ms = self.config.deadline_ms,
            "bidirectional call started"
        );

        BidiCall {
            inbound: InboundStream::new(inbound_queue, parts.scope.clone(), self.role),
            outbound: OutboundSink::new(outbound_queue, parts.scope.clone()),
            control: parts.call_control(),
        }
    }

    /// Run `handler` over a bidirectional call.
    ///
    /// `Ok(())` half-closes the call once the queued responses are written;
    /// `Err(e)` terminates it with `to_status(e)`. Requests left unread when
    /// the handler returns are discarded.
    pub fn serve_bidi<In, Out, T, F, Fut, E>(self, transport: Arc<T>, handler: F) -> CallControl
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
        F: FnOnce(InboundStream<In>, OutboundSink<Out>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let (inbound, outbound, control) = self.bidi(transport).split();
        let sink = outbound.clone();
        let scope = control.scope.clone();

        control.spawner.spawn(async move {
            match handler(inbound, outbound).await {
                Ok(()) => {
                    sink.close();
                }
                Err(err) => {
                    let status = to_status(err);
                    warn!(code = ?status.code(), message = status.message(), "call handler failed");
                    scope.cancel(CancelOrigin::Local, status.clone());
                    sink.fail(status);
                }
            }
        });
        control
    }

    /// Send `request` and read the response stream.
    ///
    /// Response credit is preloaded one message at a time, gated on
    /// readiness and spare queue capacity.
    #[tracing::instrument(skip_all, fields(role = %self.role))]
    pub fn response_stream<In, Out, T>(self, transport: Arc<T>, request: Out) -> ResponseStream<In>
    where
        In: Send + 'static,
        Out: Send + 'static,
        T: CallTransport<In, Out>,
    {
        let parts = self.parts::<In, Out>(transport);
        let inbound_queue = BoundedQueue::new(self.config.inbound_capacity);

        let outbound_queue = BoundedQueue::new(1);
        if outbound_queue.try_send(request).is_err() {
            warn!("request could not be queued");
        }
        outbound_queue.close(Termination::Completed);

        let inbound = PreloadFlow::new(
            inbound_queue.clone(),
            parts.credit_control(),
            parts.spawner.clone(),
            parts.counters.clone(),
        );
        parts.start(inbound, outbound_queue, &self.config);

        debug!(
            inbound_capacity = inbound_queue.capacity(),
            "response stream started"
        );

        ResponseStream {
            inbound: InboundStream::new(inbound_queue, parts.scope.clone(), self.role),
            control: parts.call_control(),
        }
    }
}

/// Serve a bidirectional call with `handler` in the server role.
pub fn serve_bidi<In, Out, T, F, Fut, E>(
    transport: Arc<T>,
    config: FlowConfig,
    handler: F,
) -> CallControl
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
    F: FnOnce(InboundStream<In>, OutboundSink<Out>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    CallBuilder::server()
        .config(config)
        .serve_bidi(transport, handler)
}

/// Send one request in the client role and read the response stream.
pub fn response_stream<In, Out, T>(
    transport: Arc<T>,
    config: FlowConfig,
    request: Out,
) -> ResponseStream<In>
where
    In: Send + 'static,
    Out: Send + 'static,
    T: CallTransport<In, Out>,
{
    CallBuilder::client()
        .config(config)
        .response_stream(transport, request)
}
