//! In-memory transport for tests and benchmarks.
//!
//! [`LoopbackTransport`] plays the peer: it delivers messages only against
//! granted credit (or reports a violation), records everything the call
//! does to it and lets the caller toggle readiness, complete, fail or cancel
//! the call from the remote side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tonic::Status;
use tracing::trace;

use crate::transport::{CallListener, CallTransport, ReadyCallback};

struct State<In, Out> {
    listener: Option<Arc<dyn CallListener<In>>>,
    ready_callback: Option<ReadyCallback>,
    manual_credit: bool,
    requested: u64,
    delivered: u64,
    max_outstanding: u64,
    sent: Vec<Out>,
    half_closed: bool,
    closed_with: Option<Status>,
    cancellations: Vec<Status>,
    reject_writes: Option<Status>,
}

impl<In, Out> State<In, Out> {
    fn outstanding(&self) -> u64 {
        self.requested.saturating_sub(self.delivered)
    }

    /// Closed with an error or cancelled; no further credit will come.
    fn terminated(&self) -> bool {
        self.closed_with.is_some() || !self.cancellations.is_empty()
    }

    fn finished(&self) -> bool {
        self.half_closed || self.terminated()
    }
}

/// Instrumented in-memory peer for one call.
pub struct LoopbackTransport<In, Out> {
    state: Mutex<State<In, Out>>,
    ready: AtomicBool,
    changed: Notify,
}

impl<In, Out> LoopbackTransport<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// A transport that is ready for writes from the start.
    pub fn new() -> Arc<Self> {
        Self::with_ready(true)
    }

    pub fn with_ready(ready: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                listener: None,
                ready_callback: None,
                manual_credit: false,
                requested: 0,
                delivered: 0,
                max_outstanding: 0,
                sent: Vec::new(),
                half_closed: false,
                closed_with: None,
                cancellations: Vec::new(),
                reject_writes: None,
            }),
            ready: AtomicBool::new(ready),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<In, Out>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Arc<dyn CallListener<In>>> {
        self.lock().listener.clone()
    }

    fn touch(&self) {
        self.changed.notify_waiters();
    }

    /// Wait until `condition` holds for the recorded state.
    async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut(&State<In, Out>) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if condition(&self.lock()) {
                return;
            }
            notified.await;
        }
    }

    // Peer side.

    /// Deliver a message to the call, whether or not credit was granted.
    ///
    /// Deliveries without credit are recorded as violations through
    /// [`LoopbackTransport::credit_violations`].
    pub fn deliver(&self, message: In) {
        {
            let mut state = self.lock();
            state.delivered += 1;
        }
        if let Some(listener) = self.listener() {
            listener.deliver(message);
        }
        self.touch();
    }

    /// Wait for a granted credit, then deliver.
    ///
    /// Delivers anyway once the call was closed with an error or cancelled.
    pub async fn deliver_with_credit(&self, message: In) {
        self.wait_until(|state| state.outstanding() > 0 || state.terminated())
            .await;
        self.deliver(message);
    }

    /// Wait until at least one credit is outstanding.
    pub async fn wait_for_credit(&self) {
        self.wait_until(|state| state.outstanding() > 0).await;
    }

    /// Complete the peer's outbound direction.
    pub fn complete(&self) {
        if let Some(listener) = self.listener() {
            listener.on_completed();
        }
        self.touch();
    }

    /// Fail the call from the peer side.
    pub fn fail(&self, status: Status) {
        if let Some(listener) = self.listener() {
            listener.on_error(status);
        }
        self.touch();
    }

    /// Cancel the call from the peer side.
    pub fn cancel_from_peer(&self) {
        if let Some(listener) = self.listener() {
            listener.on_cancel();
        }
        self.touch();
    }

    /// Change write readiness and notify the call.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        self.fire_ready();
    }

    /// Invoke the readiness callback without changing readiness.
    pub fn fire_ready(&self) {
        let callback = self.lock().ready_callback.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Make every subsequent write fail with `status`.
    pub fn reject_writes(&self, status: Status) {
        self.lock().reject_writes = Some(status);
    }

    // Observations.

    pub fn is_started(&self) -> bool {
        self.lock().listener.is_some()
    }

    pub fn is_manual_credit(&self) -> bool {
        self.lock().manual_credit
    }

    /// Total credits granted so far.
    pub fn credits_requested(&self) -> u64 {
        self.lock().requested
    }

    /// Credits granted and not yet used.
    pub fn outstanding_credit(&self) -> u64 {
        self.lock().outstanding()
    }

    /// Highest number of credits outstanding at any time.
    pub fn max_outstanding_credit(&self) -> u64 {
        self.lock().max_outstanding
    }

    /// Number of messages delivered beyond the granted credit.
    pub fn credit_violations(&self) -> u64 {
        let state = self.lock();
        state.delivered.saturating_sub(state.requested)
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    pub fn is_half_closed(&self) -> bool {
        self.lock().half_closed
    }

    /// Status the call was closed with (server role).
    pub fn closed_status(&self) -> Option<Status> {
        self.lock().closed_with.clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancellations.len()
    }

    pub fn cancellations(&self) -> Vec<Status> {
        self.lock().cancellations.clone()
    }

    /// Wait until the call half-closed, closed or cancelled.
    pub async fn finished(&self) {
        self.wait_until(State::finished).await;
    }

    /// Wait until at least `count` messages were written.
    pub async fn wait_for_sent(&self, count: usize) {
        self.wait_until(|state| state.sent.len() >= count || state.finished())
            .await;
    }
}

impl<In, Out> LoopbackTransport<In, Out>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
{
    /// Messages written by the call so far, in order.
    pub fn sent(&self) -> Vec<Out> {
        self.lock().sent.clone()
    }
}

impl<In, Out> CallTransport<In, Out> for LoopbackTransport<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn start(&self, listener: Arc<dyn CallListener<In>>) {
        self.lock().listener = Some(listener);
        if self.ready.load(Ordering::SeqCst) {
            self.fire_ready();
        }
        self.touch();
    }

    fn disable_automatic_credit(&self) {
        self.lock().manual_credit = true;
    }

    fn request_credit(&self, count: u32) {
        {
            let mut state = self.lock();
            state.requested += u64::from(count);
            state.max_outstanding = state.max_outstanding.max(state.outstanding());
            trace!(count, outstanding = state.outstanding(), "loopback credit granted");
        }
        self.touch();
    }

    fn set_ready_callback(&self, callback: ReadyCallback) {
        self.lock().ready_callback = Some(callback);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send_message(&self, message: Out) -> Result<(), Status> {
        {
            let mut state = self.lock();
            if let Some(status) = &state.reject_writes {
                return Err(status.clone());
            }
            if state.finished() {
                return Err(Status::failed_precondition("loopback call already closed"));
            }
            state.sent.push(message);
        }
        self.touch();
        Ok(())
    }

    fn half_close(&self) {
        self.lock().half_closed = true;
        self.touch();
    }

    fn close_with_error(&self, status: Status) {
        self.lock().closed_with = Some(status);
        self.touch();
    }

    fn cancel(&self, status: Status) {
        self.lock().cancellations.push(status);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        delivered: Mutex<Vec<u32>>,
        completed: AtomicBool,
    }

    impl CallListener<u32> for Recorder {
        fn deliver(&self, message: u32) {
            self.delivered.lock().unwrap().push(message);
        }

        fn on_error(&self, _status: Status) {}

        fn on_completed(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }

        fn on_cancel(&self) {}
    }

    #[test]
    fn test_tracks_outstanding_credit() {
        let transport = LoopbackTransport::<u32, u32>::new();
        transport.request_credit(2);
        assert_eq!(transport.outstanding_credit(), 2);
        transport.deliver(1);
        assert_eq!(transport.outstanding_credit(), 1);
        assert_eq!(transport.max_outstanding_credit(), 2);
        assert_eq!(transport.credit_violations(), 0);

        transport.deliver(2);
        transport.deliver(3);
        assert_eq!(transport.credit_violations(), 1);
    }

    #[test]
    fn test_forwards_to_listener() {
        let transport = LoopbackTransport::<u32, u32>::new();
        let recorder = Arc::new(Recorder {
            delivered: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        });
        transport.start(recorder.clone());
        transport.deliver(7);
        transport.complete();

        assert!(transport.is_started());
        assert_eq!(*recorder.delivered.lock().unwrap(), vec![7]);
        assert!(recorder.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_fires_ready_callback_when_ready() {
        let transport = LoopbackTransport::<u32, u32>::with_ready(true);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        transport.set_ready_callback(Arc::new(move || flag.store(true, Ordering::SeqCst)));
        transport.start(Arc::new(Recorder {
            delivered: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_writes_rejected_after_half_close() {
        let transport = LoopbackTransport::<u32, u32>::new();
        transport.send_message(1).unwrap();
        transport.half_close();
        assert!(transport.send_message(2).is_err());
        assert_eq!(transport.sent(), vec![1]);
    }

    #[tokio::test]
    async fn test_deliver_with_credit_waits() {
        let transport = LoopbackTransport::<u32, u32>::new();
        let peer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.deliver_with_credit(1).await })
        };
        tokio::task::yield_now().await;
        assert!(!peer.is_finished());

        transport.request_credit(1);
        peer.await.unwrap();
        assert_eq!(transport.credit_violations(), 0);
        assert_eq!(transport.outstanding_credit(), 0);
    }
}
