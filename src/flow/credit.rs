//! Credit request guard.
//!
//! Calls run with manual flow control and ask for one message at a time. The
//! latch records "a credit request is outstanding and unfulfilled" so that
//! concurrent paths (readiness callbacks, slow-path sends) never issue a
//! second request on top of the first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Access to the call's credit and readiness controls.
///
/// Implemented by the call handle. Coordinators hold it through a `Weak`
/// reference and never own the call.
pub trait CreditControl: Send + Sync {
    /// Ask the peer for `count` more messages.
    fn request_credit(&self, count: u32);

    /// Whether the transport would accept a write right now.
    fn is_ready(&self) -> bool;
}

/// Single outstanding credit request flag.
///
/// Uses atomic compare-and-set so that exactly one of several racing
/// claimants wins the right to request credit.
#[derive(Debug, Default)]
pub struct CreditLatch {
    claimed: AtomicBool,
    issued: AtomicU64,
}

impl CreditLatch {
    /// Create a released latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the latch if it is released.
    ///
    /// Returns true if this caller moved it from released to claimed and is
    /// therefore responsible for issuing the credit request.
    pub fn try_claim(&self) -> bool {
        let won = self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.issued.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    /// Mark a request as outstanding regardless of the current state.
    pub fn claim(&self) {
        self.claimed.store(true, Ordering::SeqCst);
    }

    /// Release the latch once the requested message has been handled.
    pub fn release(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }

    /// Whether a request is currently outstanding.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Number of successful claims so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}
