//! Outbound flow coordinator for credit-paced streams.
//!
//! Hands values into a bounded queue one credit at a time. The
//! [`CreditLatch`] tracks the single outstanding request; the credit gate in
//! [`PreloadFlow::on_ready`] issues a request only when the transport is
//! ready, the queue has room and no request is outstanding. A value that
//! finds the queue full keeps the latch claimed while it waits, so the gate
//! cannot preload a second value behind it.

use std::sync::{Arc, Weak};

use tracing::trace;

use super::credit::{CreditControl, CreditLatch};
use super::stats::FlowCounters;
use super::{InboundSide, Spawner};
use crate::error::TrySendError;
use crate::queue::{BoundedQueue, Termination};

/// Moves values into a queue while keeping at most one credit outstanding.
pub struct PreloadFlow<T> {
    me: Weak<Self>,
    queue: Arc<BoundedQueue<T>>,
    latch: CreditLatch,
    control: Weak<dyn CreditControl>,
    spawner: Spawner,
    counters: Arc<FlowCounters>,
}

impl<T: Send + 'static> PreloadFlow<T> {
    pub fn new(
        queue: Arc<BoundedQueue<T>>,
        control: Weak<dyn CreditControl>,
        spawner: Spawner,
        counters: Arc<FlowCounters>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            latch: CreditLatch::new(),
            control,
            spawner,
            counters,
        })
    }

    /// Whether a credit request is outstanding.
    pub fn is_preloaded(&self) -> bool {
        self.latch.is_claimed()
    }

    /// Hand a value to the queue.
    ///
    /// Accepted immediately: the next credit is requested at once. Queue
    /// full: the value takes its place in line and the next credit is
    /// requested after it has been enqueued. Queue closed: the value is
    /// dropped.
    pub fn offer(&self, value: T) {
        let value = match self.queue.try_send(value) {
            Ok(()) => {
                self.latch.release();
                self.request_next();
                return;
            }
            Err(TrySendError::Closed(value)) => {
                self.counters.late_delivery();
                trace!("queue closed, dropping offered value");
                drop(value);
                return;
            }
            Err(TrySendError::Full(value)) => value,
        };

        let Some(me) = self.me.upgrade() else {
            return;
        };

        self.latch.claim();
        self.counters.deferred_enqueue();
        let enqueue = self.queue.send(value);
        self.spawner.spawn(async move {
            match enqueue.await {
                Ok(()) => {
                    me.latch.release();
                    me.request_next();
                }
                Err(err) => {
                    trace!(error = %err, "deferred enqueue failed");
                    me.queue.close(Termination::Failed(err.into_status()));
                }
            }
        });
    }

    /// Credit gate, run on every readiness notification.
    pub fn on_ready(&self) {
        let Some(control) = self.control.upgrade() else {
            return;
        };
        if control.is_ready()
            && !self.queue.is_full()
            && !self.queue.is_closed_for_send()
            && self.latch.try_claim()
        {
            trace!("credit gate open, requesting next value");
            control.request_credit(1);
        }
    }

    fn request_next(&self) {
        if self.queue.is_closed_for_send() || !self.latch.try_claim() {
            return;
        }
        if let Some(control) = self.control.upgrade() {
            control.request_credit(1);
        }
    }
}

impl<T: Send + 'static> InboundSide<T> for PreloadFlow<T> {
    fn on_value(&self, value: T) {
        self.offer(value);
    }

    fn on_upstream_completed(&self) {
        self.queue.close(Termination::Completed);
    }

    fn on_ready(&self) {
        PreloadFlow::on_ready(self);
    }

    fn queue(&self) -> &Arc<BoundedQueue<T>> {
        &self.queue
    }
}
