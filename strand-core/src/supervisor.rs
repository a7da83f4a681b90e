//! Observation of forked fibers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kempt::Map;
use parking_lot::Mutex;

use crate::fiber::RuntimeFiber;
use crate::id::FiberId;
use crate::instruction::ErasedExit;

/// Observes the fibers forked within a supervised region.
///
/// Callbacks are invoked on the thread of the fiber that triggered them while
/// that fiber is executing. They must not block on other fibers.
pub trait Supervisor: Send + Sync + 'static {
    /// Invoked after `fiber` is created and before it starts executing.
    fn on_start(&self, fiber: &RuntimeFiber);

    /// Invoked after the fiber identified by `fiber` exits.
    fn on_end(&self, fiber: FiberId, exit: &ErasedExit);
}

/// A [`Supervisor`] that keeps track of the fibers that are still running.
#[derive(Default)]
pub struct Tracker {
    live: Mutex<Map<FiberId, RuntimeFiber>>,
    started: AtomicUsize,
    ended: AtomicUsize,
}

impl Tracker {
    /// Returns a new tracker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the supervised fibers that have not exited yet.
    #[must_use]
    pub fn live(&self) -> Vec<RuntimeFiber> {
        self.live
            .lock()
            .iter()
            .map(|field| field.value.clone())
            .collect()
    }

    /// Returns the number of supervised fibers that have started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    /// Returns the number of supervised fibers that have exited.
    #[must_use]
    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::Acquire)
    }
}

impl Supervisor for Tracker {
    fn on_start(&self, fiber: &RuntimeFiber) {
        self.started.fetch_add(1, Ordering::AcqRel);
        self.live.lock().insert(fiber.id(), fiber.clone());
    }

    fn on_end(&self, fiber: FiberId, _exit: &ErasedExit) {
        self.ended.fetch_add(1, Ordering::AcqRel);
        self.live.lock().remove(&fiber);
    }
}
