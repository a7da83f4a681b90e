//! Scheduling of fiber work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::effect::{Effect, Output};
use crate::exit::Exit;
use crate::platform::{Platform, RuntimeConfig};
use crate::runtime::Runtime;

/// A unit of work submitted to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send>;

/// Executes fiber work.
///
/// Implementors must never run a task on the thread that submitted it before
/// returning from [`dispatch`](Self::dispatch). Fibers hold internal locks
/// while they submit work, and running the task inline would deadlock.
pub trait Scheduler: Send + Sync + 'static {
    /// Executes `task` as soon as possible.
    fn dispatch(&self, task: Task);

    /// Executes `task` no earlier than `deadline`.
    fn dispatch_at(&self, deadline: Instant, task: Task);
}

/// A scheduler that runs tasks on the thread that drives it.
///
/// Nothing runs until [`CurrentThread::block_on`] or
/// [`CurrentThread::run_until_idle`] is called.
#[derive(Default)]
pub struct CurrentThread {
    queue: Mutex<Queue>,
    sync: Condvar,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Task>,
    timers: VecDeque<Timer>,
}

struct Timer {
    deadline: Instant,
    task: Task,
}

impl Queue {
    fn promote_expired(&mut self, now: Instant) {
        while self
            .timers
            .front()
            .is_some_and(|timer| timer.deadline <= now)
        {
            let Some(timer) = self.timers.pop_front() else {
                break;
            };
            self.ready.push_back(timer.task);
        }
    }
}

impl CurrentThread {
    /// Returns a new, empty scheduler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a runtime whose fibers are executed by this scheduler.
    #[must_use]
    pub fn runtime(self: &Arc<Self>, config: RuntimeConfig) -> Runtime {
        Runtime::new(Platform::new(self.clone()).with_config(config))
    }

    /// Runs every task that is ready, including timers whose deadline has
    /// passed. Returns the number of tasks executed.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while let Some(task) = self.next_ready() {
            task();
            executed += 1;
        }
        executed
    }

    /// Spawns `effect` on a fiber of a new runtime and drives this scheduler
    /// until the fiber exits.
    pub fn block_on<A, E>(self: &Arc<Self>, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Output,
        E: Output,
    {
        let runtime = self.runtime(RuntimeConfig::default());
        self.block_on_in(&runtime, effect)
    }

    /// Spawns `effect` on `runtime` and drives this scheduler until the fiber
    /// exits. `runtime` should be driven by this scheduler.
    pub fn block_on_in<A, E>(&self, runtime: &Runtime, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Output,
        E: Output,
    {
        let fiber = runtime.spawn(effect);
        loop {
            if let Some(exit) = fiber.poll() {
                return exit;
            }
            if let Some(task) = self.next_ready() {
                task();
                continue;
            }

            let mut queue = self.queue.lock();
            if !queue.ready.is_empty() || fiber.poll().is_some() {
                continue;
            }
            match queue.timers.front().map(|timer| timer.deadline) {
                Some(deadline) => {
                    self.sync.wait_until(&mut queue, deadline);
                }
                None => self.sync.wait(&mut queue),
            }
        }
    }

    fn next_ready(&self) -> Option<Task> {
        let mut queue = self.queue.lock();
        queue.promote_expired(Instant::now());
        queue.ready.pop_front()
    }
}

impl Scheduler for CurrentThread {
    fn dispatch(&self, task: Task) {
        self.queue.lock().ready.push_back(task);
        self.sync.notify_one();
    }

    fn dispatch_at(&self, deadline: Instant, task: Task) {
        let mut queue = self.queue.lock();
        let index = queue
            .timers
            .iter()
            .position(|timer| timer.deadline > deadline)
            .unwrap_or(queue.timers.len());
        queue.timers.insert(index, Timer { deadline, task });
        drop(queue);
        self.sync.notify_one();
    }
}
