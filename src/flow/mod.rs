//! Flow control infrastructure.
//!
//! Provides:
//! - Credit request guard and the call's credit/readiness controls
//! - Readiness tracking for outbound writes
//! - Inbound and preload coordinators that pace credit against queue capacity
//! - Per-call counters

pub mod credit;
pub mod inbound;
pub mod preload;
pub mod ready;
pub mod stats;

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::queue::BoundedQueue;

/// Receiving half of a call, driven by the transport's listener callbacks.
pub trait InboundSide<T>: Send + Sync {
    /// A message was delivered against a previously requested credit.
    fn on_value(&self, value: T);

    /// The transport will deliver nothing more.
    fn on_upstream_completed(&self);

    /// Write readiness may have changed.
    fn on_ready(&self) {}

    /// The queue consumers read from.
    fn queue(&self) -> &Arc<BoundedQueue<T>>;
}

/// Spawns detached call work on the runtime captured at call start.
///
/// Everything spawned is tracked, so a call can wait for its own tasks.
#[derive(Clone, Debug)]
pub struct Spawner {
    runtime: Handle,
    tasks: TaskTracker,
}

impl Spawner {
    pub fn new(runtime: Handle, tasks: TaskTracker) -> Self {
        Self { runtime, tasks }
    }

    /// Capture the current runtime with a fresh tracker.
    ///
    /// Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current(), TaskTracker::new())
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn_on(task, &self.runtime);
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tasks
    }
}
