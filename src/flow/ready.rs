//! Readiness tracking for outbound writes.
//!
//! The transport reports "readiness may have changed" through a callback.
//! [`ReadyTracker`] folds those callbacks into a single-slot permit so that a
//! writer can simply `await_ready().await` before every write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use super::credit::CreditControl;

/// Converts readiness callbacks into an awaitable condition.
///
/// Notifications coalesce: any number of `signal()` calls between two waits
/// leave a single permit. The first wait always suspends until a notification
/// has been observed; later waits re-check the transport first.
pub struct ReadyTracker {
    control: Weak<dyn CreditControl>,
    permit: Notify,
    observed: AtomicBool,
    cancelled: CancellationToken,
    cause: OnceLock<Status>,
}

impl ReadyTracker {
    /// Create a tracker that consults `control` for the current readiness.
    pub fn new(control: Weak<dyn CreditControl>) -> Self {
        Self {
            control,
            permit: Notify::new(),
            observed: AtomicBool::new(false),
            cancelled: CancellationToken::new(),
            cause: OnceLock::new(),
        }
    }

    /// Record a readiness notification from the transport.
    pub fn signal(&self) {
        self.permit.notify_one();
    }

    /// Wait until the transport can accept a write.
    ///
    /// Fails with the cancellation cause once [`ReadyTracker::cancel`] has
    /// been called, or with `CANCELLED` if the call is gone.
    pub async fn await_ready(&self) -> Result<(), Status> {
        if !self.observed.load(Ordering::Acquire) {
            self.wait_notification().await?;
            self.observed.store(true, Ordering::Release);
        }

        loop {
            if let Some(status) = self.cancel_status() {
                return Err(status);
            }
            let ready = match self.control.upgrade() {
                Some(control) => control.is_ready(),
                None => return Err(Status::cancelled("call has been released")),
            };
            if ready {
                return Ok(());
            }
            self.wait_notification().await?;
        }
    }

    async fn wait_notification(&self) -> Result<(), Status> {
        tokio::select! {
            biased;
            () = self.cancelled.cancelled() => Err(self
                .cancel_status()
                .unwrap_or_else(|| Status::cancelled("readiness wait cancelled"))),
            () = self.permit.notified() => Ok(()),
        }
    }

    /// Permanently fail all current and future waits with `cause`.
    ///
    /// Only the first cause is kept.
    pub fn cancel(&self, cause: Status) {
        let _ = self.cause.set(cause);
        self.cancelled.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    fn cancel_status(&self) -> Option<Status> {
        if self.cancelled.is_cancelled() {
            self.cause.get().cloned()
        } else {
            None
        }
    }
}
