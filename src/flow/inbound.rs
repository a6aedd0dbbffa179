//! Inbound flow coordinator.
//!
//! Accepts values pushed by the transport, moves them into the inbound queue
//! and asks for the next value only once the previous one has a place in the
//! queue. Values that cannot be enqueued immediately wait on a detached task,
//! with their queue position fixed at delivery time.
//!
//! Completion is tracked with an in-flight counter: the queue is closed only
//! after the transport completed and every delivered value has been
//! enqueued.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::credit::CreditControl;
use super::stats::FlowCounters;
use super::{InboundSide, Spawner};
use crate::error::TrySendError;
use crate::observability::metrics;
use crate::queue::{BoundedQueue, Termination};

/// Paces inbound credit against the consumer's progress.
pub struct InboundFlow<T> {
    me: Weak<Self>,
    queue: Arc<BoundedQueue<T>>,
    control: Weak<dyn CreditControl>,
    spawner: Spawner,
    counters: Arc<FlowCounters>,
    in_flight: AtomicUsize,
    upstream_completed: AtomicBool,
}

impl<T: Send + 'static> InboundFlow<T> {
    pub fn new(
        queue: Arc<BoundedQueue<T>>,
        control: Weak<dyn CreditControl>,
        spawner: Spawner,
        counters: Arc<FlowCounters>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            control,
            spawner,
            counters,
            in_flight: AtomicUsize::new(0),
            upstream_completed: AtomicBool::new(false),
        })
    }

    /// Values delivered by the transport but not yet in the queue.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_upstream_completed(&self) -> bool {
        self.upstream_completed.load(Ordering::SeqCst)
    }

    /// Handle a value pushed by the transport.
    pub fn on_value(&self, value: T) {
        self.enter();

        let value = match self.queue.try_send(value) {
            Ok(()) => {
                self.leave();
                self.request_next_or_close();
                return;
            }
            Err(TrySendError::Closed(value)) => {
                self.leave();
                self.counters.late_delivery();
                trace!("inbound queue closed, dropping late delivery");
                drop(value);
                return;
            }
            Err(TrySendError::Full(value)) => value,
        };

        let Some(me) = self.me.upgrade() else {
            self.leave();
            return;
        };

        self.counters.deferred_enqueue();
        let enqueue = self.queue.send(value);
        self.spawner.spawn(async move {
            let result = enqueue.await;
            me.leave();
            match result {
                Ok(()) => {
                    if !me.queue.is_closed_for_receive() {
                        me.request_next_or_close();
                    }
                }
                Err(err) => {
                    trace!(error = %err, "deferred inbound enqueue failed");
                    me.queue.close(Termination::Failed(err.into_status()));
                }
            }
        });
    }

    /// Close the queue if the call is fully drained, otherwise ask for the
    /// next value.
    pub fn request_next_or_close(&self) {
        if self.upstream_completed.load(Ordering::SeqCst) && self.in_flight.load(Ordering::SeqCst) == 0
        {
            if self.queue.close(Termination::Completed) {
                debug!("inbound drained after upstream completion, queue closed");
            }
        } else if let Some(control) = self.control.upgrade() {
            control.request_credit(1);
        }
    }

    /// Record that the transport completed; close now if nothing is in flight.
    pub fn on_upstream_completed(&self) {
        self.upstream_completed.store(true, Ordering::SeqCst);
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if in_flight == 0 {
            if self.queue.close(Termination::Completed) {
                debug!("upstream completed, inbound queue closed");
            }
        } else {
            debug!(in_flight, "upstream completed, waiting for in-flight values");
        }
    }

    fn enter(&self) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_inflight(self.counters.role(), in_flight);
    }

    fn leave(&self) {
        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_inflight(self.counters.role(), in_flight);
    }
}

impl<T: Send + 'static> InboundSide<T> for InboundFlow<T> {
    fn on_value(&self, value: T) {
        InboundFlow::on_value(self, value);
    }

    fn on_upstream_completed(&self) {
        InboundFlow::on_upstream_completed(self);
    }

    fn queue(&self) -> &Arc<BoundedQueue<T>> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio_util::task::TaskTracker;

    #[derive(Default)]
    struct Credits {
        requested: AtomicU32,
    }

    impl CreditControl for Credits {
        fn request_credit(&self, count: u32) {
            self.requested.fetch_add(count, Ordering::SeqCst);
        }

        fn is_ready(&self) -> bool {
            true
        }
    }

    struct Harness {
        credits: Arc<Credits>,
        // Keeps the weak reference alive.
        _control: Arc<dyn CreditControl>,
        flow: Arc<InboundFlow<&'static str>>,
        queue: Arc<BoundedQueue<&'static str>>,
        tasks: TaskTracker,
    }

    fn harness(capacity: usize) -> Harness {
        let credits = Arc::new(Credits::default());
        let control: Arc<dyn CreditControl> = credits.clone();
        let queue = BoundedQueue::new(capacity);
        let spawner = Spawner::current();
        let tasks = spawner.tracker().clone();
        let flow = InboundFlow::new(
            queue.clone(),
            Arc::downgrade(&control),
            spawner,
            Arc::new(FlowCounters::new("test")),
        );
        Harness {
            credits,
            _control: control,
            flow,
            queue,
            tasks,
        }
    }

    impl Harness {
        fn requested(&self) -> u32 {
            self.credits.requested.load(Ordering::SeqCst)
        }

        async fn settle(&self) {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn test_immediate_enqueue_requests_next() {
        let h = harness(2);
        h.flow.on_value("a");
        assert_eq!(h.requested(), 1);
        assert_eq!(h.flow.in_flight(), 0);
        assert_eq!(h.queue.recv().await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn test_full_queue_defers_credit_until_enqueued() {
        let h = harness(1);
        h.flow.on_value("a");
        assert_eq!(h.requested(), 1);

        h.flow.on_value("b");
        h.settle().await;
        assert_eq!(h.flow.in_flight(), 1);
        assert_eq!(h.requested(), 1);

        assert_eq!(h.queue.recv().await.unwrap(), Some("a"));
        h.settle().await;
        assert_eq!(h.flow.in_flight(), 0);
        assert_eq!(h.requested(), 2);
        assert_eq!(h.queue.recv().await.unwrap(), Some("b"));
    }

    #[tokio::test]
    async fn test_back_to_back_deliveries_keep_order() {
        let h = harness(1);
        h.flow.on_value("a");
        h.flow.on_value("b");
        h.flow.on_value("c");

        let mut received = Vec::new();
        while received.len() < 3 {
            received.push(h.queue.recv().await.unwrap().unwrap());
        }
        assert_eq!(received, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_completion_waits_for_in_flight() {
        let h = harness(1);
        h.flow.on_value("a");
        h.flow.on_value("b");
        h.flow.on_upstream_completed();
        h.settle().await;

        assert!(h.flow.is_upstream_completed());
        assert!(!h.queue.is_closed_for_send());

        assert_eq!(h.queue.recv().await.unwrap(), Some("a"));
        assert_eq!(h.queue.recv().await.unwrap(), Some("b"));
        assert_eq!(h.queue.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_completion_with_nothing_in_flight_closes() {
        let h = harness(1);
        h.flow.on_upstream_completed();
        assert!(h.queue.is_closed_for_receive());
        assert_eq!(h.requested(), 0);
    }

    #[tokio::test]
    async fn test_late_delivery_is_dropped() {
        let h = harness(1);
        h.queue.close(Termination::Completed);
        h.flow.on_value("late");
        assert_eq!(h.flow.in_flight(), 0);
        assert_eq!(h.flow.counters.snapshot().late_deliveries, 1);
        assert_eq!(h.requested(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queue_fails_deferred_send() {
        let h = harness(1);
        h.flow.on_value("a");
        h.flow.on_value("b");
        h.settle().await;

        h.queue.cancel(tonic::Status::cancelled("consumer gone"));
        h.tasks.close();
        h.tasks.wait().await;

        assert_eq!(h.flow.in_flight(), 0);
        assert_eq!(h.requested(), 1);
        assert!(h.queue.is_closed_for_receive());
    }
}
