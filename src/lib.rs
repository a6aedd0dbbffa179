//! Backflow: credit-based flow control for bidirectional streaming RPC calls.
//!
//! A streaming transport pushes inbound messages through callbacks, hands out
//! receive credit on request and signals readiness for writes asynchronously.
//! Backflow turns such a call into a pair of bounded queues that ordinary
//! `async` code can read and write, without breaking the transport's
//! flow-control rules.
//!
//! # Architecture
//!
//! - **One credit at a time**: at most one credit request is outstanding per
//!   direction, and a new one is issued only once the queue has room
//! - **Ordered**: each direction keeps delivery order end to end, even when a
//!   value has to wait for queue capacity
//! - **Never early**: the inbound queue closes only after the transport has
//!   completed and every delivered value has been enqueued
//! - **Bidirectional cancellation**: peer cancellation unblocks local waiters,
//!   local cancellation reaches the transport exactly once
//!
//! # Modules
//!
//! - [`call`]: Call assembly (client and server roles), streams and handles
//! - [`bridge`]: Terminal-signal wiring between transport, queues and scope
//! - [`config`]: CLI and environment configuration
//! - [`error`]: Error types and cause translation
//! - [`flow`]: Readiness tracking and the inbound/outbound coordinators
//! - [`loopback`]: In-memory transport for tests and benchmarks
//! - [`observability`]: Metrics and tracing setup
//! - [`queue`]: Bounded, ordered, closable message queue
//! - [`transport`]: Interface implemented by streaming transports

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // flow::inbound::InboundFlow is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc,      // Panic docs can be verbose
    clippy::type_complexity          // Callback types are spelled out once
)]

pub mod bridge;
pub mod call;
pub mod config;
pub mod error;
pub mod flow;
pub mod loopback;
pub mod observability;
pub mod queue;
pub mod transport;

pub use call::{
    BidiCall, CallBuilder, CallControl, ClientStreamingCall, InboundStream, OutboundSink,
    ResponseStream, Role, SingleResponse,
};
pub use config::FlowConfig;
pub use error::{to_status, QueueError, TrySendError};
pub use transport::{CallListener, CallTransport};
