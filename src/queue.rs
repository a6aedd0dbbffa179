//! Bounded, ordered message queue used for both directions of a call.
//!
//! Besides the usual non-blocking and suspending operations the queue has two
//! properties the flow coordinators depend on:
//!
//! - A suspending send takes its place in line when [`BoundedQueue::send`] is
//!   called, not when the returned future is first polled. Two sends issued
//!   back to back from a callback therefore land in call order, even when the
//!   futures are driven on different tasks.
//! - Closing keeps everything already accepted (buffered values and sends
//!   registered before the close) drainable. Only [`BoundedQueue::cancel`]
//!   discards.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::sync::{oneshot, watch, Notify};
use tonic::Status;

use crate::error::{QueueError, TrySendError};

/// How a queue was closed.
#[derive(Debug, Clone)]
pub enum Termination {
    /// Closed normally; readers see end of stream after draining.
    Completed,
    /// Closed with a failure; readers see the status after draining.
    Failed(Status),
}

impl Termination {
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Completed => None,
            Self::Failed(status) => Some(status),
        }
    }

    fn into_error(self) -> QueueError {
        match self {
            Self::Completed => QueueError::Closed,
            Self::Failed(status) => QueueError::Terminated(status),
        }
    }
}

/// Result of a non-blocking receive.
#[derive(Debug)]
pub enum TryRecv<T> {
    /// The next value in line.
    Item(T),
    /// Nothing buffered, queue still open.
    Empty,
    /// Drained and closed.
    Closed(Termination),
}

struct PendingSend<T> {
    ticket: u64,
    value: T,
    done: oneshot::Sender<Result<(), QueueError>>,
}

struct State<T> {
    buffer: VecDeque<T>,
    pending: VecDeque<PendingSend<T>>,
    next_ticket: u64,
    closed: Option<Termination>,
}

impl<T> State<T> {
    fn has_room(&self, capacity: usize) -> bool {
        self.buffer.len() < capacity && self.pending.is_empty()
    }
}

/// Fixed-capacity FIFO queue with ordered suspending sends.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    readable: Notify,
    termination: watch::Sender<Option<Termination>>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` values.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (termination, _) = watch::channel(None);
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                pending: VecDeque::new(),
                next_ticket: 0,
                closed: None,
            }),
            readable: Notify::new(),
            termination,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of values buffered or waiting to be buffered.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.buffer.len() + state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a `try_send` would be rejected for lack of room.
    pub fn is_full(&self) -> bool {
        !self.lock().has_room(self.capacity)
    }

    pub fn is_closed_for_send(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Closed and fully drained.
    pub fn is_closed_for_receive(&self) -> bool {
        let state = self.lock();
        state.closed.is_some() && state.buffer.is_empty() && state.pending.is_empty()
    }

    /// How the queue was closed, if it was.
    pub fn termination(&self) -> Option<Termination> {
        self.lock().closed.clone()
    }

    /// Enqueue without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Err(TrySendError::Closed(value));
        }
        if !state.has_room(self.capacity) {
            return Err(TrySendError::Full(value));
        }
        state.buffer.push_back(value);
        drop(state);
        self.readable.notify_waiters();
        Ok(())
    }

    /// Enqueue, waiting for room if necessary.
    ///
    /// The value's position is fixed before this returns. Dropping the
    /// returned future before it completes withdraws the value.
    pub fn send(self: &Arc<Self>, value: T) -> Enqueue<T> {
        let mut state = self.lock();
        if let Some(termination) = &state.closed {
            return Enqueue::ready(Err(termination.clone().into_error()));
        }
        if state.has_room(self.capacity) {
            state.buffer.push_back(value);
            drop(state);
            self.readable.notify_waiters();
            return Enqueue::ready(Ok(()));
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (done, rx) = oneshot::channel();
        state.pending.push_back(PendingSend {
            ticket,
            value,
            done,
        });
        Enqueue {
            state: EnqueueState::Waiting {
                rx,
                ticket,
                queue: Arc::downgrade(self),
            },
        }
    }

    /// Take the next value without waiting.
    pub fn try_recv(&self) -> TryRecv<T> {
        let mut state = self.lock();
        if let Some(value) = state.buffer.pop_front() {
            if let Some(next) = state.pending.pop_front() {
                state.buffer.push_back(next.value);
                let _ = next.done.send(Ok(()));
            }
            return TryRecv::Item(value);
        }
        match &state.closed {
            Some(termination) => TryRecv::Closed(termination.clone()),
            None => TryRecv::Empty,
        }
    }

    /// Wait for the next value.
    ///
    /// Returns `Ok(None)` once the queue is drained after a normal close and
    /// the failure status once drained after a failed close.
    pub async fn recv(&self) -> Result<Option<T>, Status> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_recv() {
                TryRecv::Item(value) => return Ok(Some(value)),
                TryRecv::Closed(Termination::Completed) => return Ok(None),
                TryRecv::Closed(Termination::Failed(status)) => return Err(status),
                TryRecv::Empty => notified.await,
            }
        }
    }

    /// Wait until a value is buffered or the queue is closed.
    pub async fn readable(&self) {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if !state.buffer.is_empty() || state.closed.is_some() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting values. Returns `false` if already closed.
    pub fn close(&self, termination: Termination) -> bool {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(termination.clone());
        drop(state);

        self.termination.send_replace(Some(termination));
        self.readable.notify_waiters();
        true
    }

    /// Close with `status` and discard everything not yet received.
    ///
    /// Pending senders are failed with the status. Returns `false` if the
    /// queue was already closed, in which case the original termination is
    /// kept but buffered values are still discarded.
    pub fn cancel(&self, status: Status) -> bool {
        let mut state = self.lock();
        let newly_closed = state.closed.is_none();
        if newly_closed {
            state.closed = Some(Termination::Failed(status.clone()));
        }
        let discarded = std::mem::take(&mut state.buffer);
        let pending = std::mem::take(&mut state.pending);
        drop(state);

        for send in pending {
            let _ = send.done.send(Err(QueueError::Terminated(status.clone())));
        }
        drop(discarded);

        if newly_closed {
            self.termination
                .send_replace(Some(Termination::Failed(status)));
        }
        self.readable.notify_waiters();
        newly_closed
    }

    /// Wait until the queue is closed for sending.
    pub async fn closed(&self) -> Termination {
        let mut rx = self.termination.subscribe();
        let termination = rx.wait_for(Option::is_some).await.map(|t| t.clone());
        match termination {
            Ok(Some(termination)) => termination,
            _ => Termination::Completed,
        }
    }

    fn withdraw(&self, ticket: u64) {
        self.lock().pending.retain(|send| send.ticket != ticket);
    }
}

enum EnqueueState<T> {
    Ready(Option<Result<(), QueueError>>),
    Waiting {
        rx: oneshot::Receiver<Result<(), QueueError>>,
        ticket: u64,
        queue: Weak<BoundedQueue<T>>,
    },
    Done,
}

/// Future returned by [`BoundedQueue::send`].
#[must_use = "the value is already queued; await to learn whether it was accepted"]
pub struct Enqueue<T> {
    state: EnqueueState<T>,
}

impl<T> Enqueue<T> {
    fn ready(result: Result<(), QueueError>) -> Self {
        Self {
            state: EnqueueState::Ready(Some(result)),
        }
    }

    /// Whether the value was accepted without waiting.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, EnqueueState::Ready(Some(Ok(()))))
    }
}

impl<T> Future for Enqueue<T> {
    type Output = Result<(), QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            EnqueueState::Ready(result) => {
                let result = result.take().unwrap_or(Err(QueueError::Closed));
                this.state = EnqueueState::Done;
                Poll::Ready(result)
            }
            EnqueueState::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(result) => {
                    this.state = EnqueueState::Done;
                    Poll::Ready(result.unwrap_or(Err(QueueError::Closed)))
                }
                Poll::Pending => Poll::Pending,
            },
            EnqueueState::Done => Poll::Ready(Err(QueueError::Closed)),
        }
    }
}

impl<T> Drop for Enqueue<T> {
    fn drop(&mut self) {
        if let EnqueueState::Waiting { ticket, queue, .. } = &self.state {
            if let Some(queue) = queue.upgrade() {
                queue.withdraw(*ticket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};
    use tonic::Code;

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let queue = BoundedQueue::<u32>::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.try_send(1).is_ok());
        assert!(queue.try_send(2).unwrap_err().is_full());
    }

    #[test]
    fn test_try_send_after_close_is_rejected() {
        let queue = BoundedQueue::new(2);
        queue.close(Termination::Completed);
        assert!(matches!(queue.try_send(1), Err(TrySendError::Closed(1))));
    }

    #[test]
    fn test_try_recv_preserves_order() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            queue.try_send(i).unwrap();
        }
        for i in 0..3 {
            assert!(matches!(queue.try_recv(), TryRecv::Item(v) if v == i));
        }
        assert!(matches!(queue.try_recv(), TryRecv::Empty));
    }

    #[test]
    fn test_send_position_fixed_before_poll() {
        let queue = BoundedQueue::new(1);
        queue.try_send("a").unwrap();

        // Registered in this order, polled in the opposite order.
        let mut first = task::spawn(queue.send("b"));
        let mut second = task::spawn(queue.send("c"));
        assert_pending!(second.poll());
        assert_pending!(first.poll());

        assert!(matches!(queue.try_recv(), TryRecv::Item("a")));
        assert!(first.is_woken());
        assert_ready!(first.poll()).unwrap();
        assert_pending!(second.poll());

        assert!(matches!(queue.try_recv(), TryRecv::Item("b")));
        assert_ready!(second.poll()).unwrap();
        assert!(matches!(queue.try_recv(), TryRecv::Item("c")));
    }

    #[test]
    fn test_try_send_cannot_overtake_pending_send() {
        let queue = BoundedQueue::new(1);
        queue.try_send(1).unwrap();
        let _waiting = queue.send(2);

        assert!(matches!(queue.try_recv(), TryRecv::Item(1)));
        // 2 was promoted into the freed slot; 3 must wait its turn.
        assert!(queue.try_send(3).unwrap_err().is_full());
        assert!(matches!(queue.try_recv(), TryRecv::Item(2)));
    }

    #[test]
    fn test_dropped_send_is_withdrawn() {
        let queue = BoundedQueue::new(1);
        queue.try_send(1).unwrap();
        drop(queue.send(2));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.try_recv(), TryRecv::Item(1)));
        assert!(matches!(queue.try_recv(), TryRecv::Empty));
    }

    #[test]
    fn test_close_keeps_registered_sends_drainable() {
        let queue = BoundedQueue::new(1);
        queue.try_send(1).unwrap();
        let mut pending = task::spawn(queue.send(2));
        assert_pending!(pending.poll());

        assert!(queue.close(Termination::Completed));
        assert!(!queue.close(Termination::Completed));
        assert!(queue.is_closed_for_send());
        assert!(!queue.is_closed_for_receive());

        assert!(matches!(queue.try_recv(), TryRecv::Item(1)));
        assert_ready!(pending.poll()).unwrap();
        assert!(matches!(queue.try_recv(), TryRecv::Item(2)));
        assert!(matches!(
            queue.try_recv(),
            TryRecv::Closed(Termination::Completed)
        ));
        assert!(queue.is_closed_for_receive());
    }

    #[test]
    fn test_cancel_discards_and_fails_pending() {
        let queue = BoundedQueue::new(1);
        queue.try_send(1).unwrap();
        let mut pending = task::spawn(queue.send(2));
        assert_pending!(pending.poll());

        assert!(queue.cancel(Status::cancelled("gone")));
        match assert_ready!(pending.poll()) {
            Err(QueueError::Terminated(status)) => assert_eq!(status.code(), Code::Cancelled),
            other => panic!("unexpected send result: {other:?}"),
        }
        assert!(queue.is_empty());
        assert!(queue.is_closed_for_receive());
    }

    #[test]
    fn test_send_after_failed_close_reports_status() {
        let queue = BoundedQueue::new(1);
        queue.close(Termination::Failed(Status::aborted("peer reset")));
        let mut send = task::spawn(queue.send(7));
        match assert_ready!(send.poll()) {
            Err(QueueError::Terminated(status)) => assert_eq!(status.code(), Code::Aborted),
            other => panic!("unexpected send result: {other:?}"),
        }
    }

    #[test]
    fn test_recv_wakes_on_send() {
        let queue = BoundedQueue::new(1);
        let mut recv = task::spawn(queue.recv());
        assert_pending!(recv.poll());

        queue.try_send(5).unwrap();
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll().map(|r| r.unwrap()), Some(5));
    }

    #[test]
    fn test_recv_reports_failure_after_draining() {
        let queue = BoundedQueue::new(2);
        queue.try_send(1).unwrap();
        queue.close(Termination::Failed(Status::internal("boom")));

        let mut recv = task::spawn(queue.recv());
        assert_ready_eq!(recv.poll().map(|r| r.unwrap()), Some(1));

        let mut recv = task::spawn(queue.recv());
        let status = assert_ready!(recv.poll()).unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_closed_resolves_with_termination() {
        let queue = BoundedQueue::<u8>::new(1);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.closed().await })
        };
        tokio::task::yield_now().await;
        queue.cancel(Status::cancelled("stop"));

        let termination = waiter.await.unwrap();
        assert_eq!(termination.status().unwrap().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_readable_returns_on_close() {
        let queue = BoundedQueue::<u8>::new(1);
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.readable().await })
        };
        tokio::task::yield_now().await;
        queue.close(Termination::Completed);
        reader.await.unwrap();
    }
}
