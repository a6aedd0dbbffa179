//! Error types for queue operations and translation of failures into
//! transport statuses.
//!
//! `tonic::Status` is the error currency on the transport side. Everything
//! that crosses into the transport goes through [`to_status`] first.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tonic::{Code, Status};

/// Boxed error accepted from application code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Status message used when the remote side cancels the call.
pub const PEER_CANCELLED: &str = "Peer has cancelled the call";

/// Status message used when the call is cancelled locally.
pub const LOCAL_CANCELLED: &str = "Call was cancelled locally";

/// Status message used when the consumer abandons the inbound stream.
pub const INBOUND_ABANDONED: &str = "Inbound stream was cancelled by the consumer";

/// Status message used when the call deadline elapses.
pub const DEADLINE_ELAPSED: &str = "Call deadline elapsed";

/// Failure of a suspending send.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The queue was closed normally before the value was accepted.
    #[error("queue is closed")]
    Closed,

    /// The queue was closed or cancelled with a failure.
    #[error("queue terminated: {}", .0.message())]
    Terminated(Status),
}

impl QueueError {
    /// The status a caller should report for this failure.
    pub fn into_status(self) -> Status {
        match self {
            Self::Closed => Status::failed_precondition("queue is closed"),
            Self::Terminated(status) => status,
        }
    }
}

impl From<QueueError> for Status {
    fn from(err: QueueError) -> Self {
        err.into_status()
    }
}

/// Failure of a non-blocking send. The rejected value is handed back.
pub enum TrySendError<T> {
    /// The queue has no spare capacity.
    Full(T),
    /// The queue no longer accepts values.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that was not sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

impl<T> StdError for TrySendError<T> {}

/// Marker error for a locally initiated cancellation.
///
/// Translates to `Code::Cancelled` rather than `Code::Unknown`.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct Cancelled {
    reason: String,
}

impl Cancelled {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Translate an arbitrary failure into a transport status.
///
/// A `Status`, whether passed directly or found in the source chain, is
/// returned as is. A [`Cancelled`] marker becomes `CANCELLED`. Anything else
/// becomes `UNKNOWN` with the original error attached as the source.
pub fn to_status<E>(err: E) -> Status
where
    E: Into<BoxError>,
{
    let err: BoxError = err.into();
    let err = match err.downcast::<Status>() {
        Ok(status) => return *status,
        Err(err) => err,
    };

    let mut cause = err.source();
    while let Some(inner) = cause {
        if let Some(status) = inner.downcast_ref::<Status>() {
            return status.clone();
        }
        cause = inner.source();
    }

    let code = if err.is::<Cancelled>() {
        Code::Cancelled
    } else {
        Code::Unknown
    };
    let mut status = Status::new(code, err.to_string());
    status.set_source(Arc::from(err));
    status
}
