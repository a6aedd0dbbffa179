//! Application-facing halves of a call.

use std::sync::Arc;

use futures::Stream;
use tonic::Status;

use super::Role;
use crate::bridge::{CallScope, CancelOrigin};
use crate::error::{to_status, BoxError, QueueError, TrySendError, INBOUND_ABANDONED, LOCAL_CANCELLED};
use crate::queue::{BoundedQueue, Termination};

/// Receiving half of a call.
///
/// Dropping a client's inbound stream before the call completed cancels the
/// call. A server's inbound stream is simply discarded.
pub struct InboundStream<T> {
    queue: Arc<BoundedQueue<T>>,
    scope: Arc<CallScope>,
    role: Role,
}

impl<T> InboundStream<T> {
    pub(crate) fn new(queue: Arc<BoundedQueue<T>>, scope: Arc<CallScope>, role: Role) -> Self {
        Self { queue, scope, role }
    }

    /// Receive the next message.
    ///
    /// `Ok(None)` marks the normal end of the stream. After cancellation or
    /// a transport failure the corresponding status is returned.
    pub async fn recv(&mut self) -> Result<Option<T>, Status> {
        if let Some(status) = self.scope.status() {
            return Err(status);
        }
        tokio::select! {
            biased;
            () = self.scope.cancelled() => Err(self
                .scope
                .status()
                .unwrap_or_else(|| Status::cancelled(LOCAL_CANCELLED))),
            item = self.queue.recv() => item,
        }
    }

    /// Whether the stream has ended and been drained.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed_for_receive()
    }

    /// Stop receiving.
    ///
    /// Buffered messages are discarded. If the peer has not finished
    /// sending, the whole call is cancelled.
    pub fn cancel(&mut self) {
        let status = Status::cancelled(INBOUND_ABANDONED);
        let still_open = !self.queue.is_closed_for_send();
        self.queue.cancel(status.clone());
        if still_open {
            self.scope.cancel(CancelOrigin::Local, status);
        }
    }

    /// Fail the call because a received message could not be processed.
    ///
    /// The error is translated with [`to_status`] and sent to the transport.
    pub fn fail<E>(&mut self, err: E)
    where
        E: Into<BoxError>,
    {
        let status = to_status(err);
        self.scope.cancel(CancelOrigin::Local, status);
    }

    pub(crate) fn discard(&self) {
        self.queue.cancel(Status::cancelled(INBOUND_ABANDONED));
    }

    /// Adapt into a `Stream` of messages. Ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold(Some(self), |state| async move {
            let mut inbound = state?;
            match inbound.recv().await {
                Ok(Some(message)) => Some((Ok(message), Some(inbound))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }
}

impl<T> Drop for InboundStream<T> {
    fn drop(&mut self) {
        if self.queue.is_closed_for_receive() {
            return;
        }
        match self.role {
            Role::Client => self.cancel(),
            Role::Server => self.discard(),
        }
    }
}

/// Closes the outbound queue normally when the last sink is dropped.
struct CloseOnDrop<T>(Arc<BoundedQueue<T>>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close(Termination::Completed);
    }
}

/// Sending half of a call. Cheap to clone.
///
/// Messages are written to the transport in the order they were accepted.
/// Closing (or dropping every clone) half-closes the call once the queue
/// has drained.
pub struct OutboundSink<T> {
    queue: Arc<BoundedQueue<T>>,
    scope: Arc<CallScope>,
    _guard: Arc<CloseOnDrop<T>>,
}

impl<T> Clone for OutboundSink<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            scope: self.scope.clone(),
            _guard: self._guard.clone(),
        }
    }
}

impl<T> OutboundSink<T> {
    pub(crate) fn new(queue: Arc<BoundedQueue<T>>, scope: Arc<CallScope>) -> Self {
        Self {
            _guard: Arc::new(CloseOnDrop(queue.clone())),
            queue,
            scope,
        }
    }

    /// Queue a message, waiting for room if the queue is full.
    pub async fn send(&self, message: T) -> Result<(), QueueError> {
        if let Some(status) = self.scope.status() {
            return Err(QueueError::Terminated(status));
        }
        let enqueue = self.queue.send(message);
        tokio::select! {
            biased;
            () = self.scope.cancelled() => Err(QueueError::Terminated(self
                .scope
                .status()
                .unwrap_or_else(|| Status::cancelled(LOCAL_CANCELLED)))),
            result = enqueue => result,
        }
    }

    /// Queue a message if there is room right now.
    pub fn try_send(&self, message: T) -> Result<(), TrySendError<T>> {
        if self.scope.is_cancelled() {
            return Err(TrySendError::Closed(message));
        }
        self.queue.try_send(message)
    }

    /// Finish sending. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.queue.close(Termination::Completed)
    }

    /// Finish sending with a failure, which terminates the call once the
    /// queued messages have been written.
    pub fn fail<E>(&self, err: E) -> bool
    where
        E: Into<BoxError>,
    {
        self.queue.close(Termination::Failed(to_status(err)))
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed_for_send()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
