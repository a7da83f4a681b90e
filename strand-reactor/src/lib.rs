//! # strand-reactor
//!
//! `strand-reactor` executes fibers on a pool of worker threads. Its primary
//! features include:
//!
//! - Spawning effects as tasks across a threadpool
//! - Waiting on a task's exit, blocking or as a future
//! - Cancelling a task
//! - Timers for sleeping fibers
//!
//! # Basic Usage
//!
//! ```rust
//! use std::convert::Infallible;
//!
//! use strand_core::{Effect, Exit};
//! use strand_reactor::Reactor;
//!
//! // Create a new reactor for tasks to run in.
//! let reactor = Reactor::new();
//!
//! // Spawn a task that computes two values concurrently.
//! let task = reactor
//!     .spawn(Effect::<u32, Infallible>::succeed(1).zip_par(Effect::succeed(2)))
//!     .unwrap();
//!
//! // Wait for the result.
//! assert_eq!(task.join(), Exit::Success((1, 2)));
//!
//! reactor.shutdown().unwrap();
//! ```
//!
//! [`TaskHandle`] is also a future that can be awaited to wait for the task to
//! exit.
#![allow(missing_docs)]
use std::any::Any;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use alot::{LotId, Lots};
use crossbeam_utils::sync::{Parker, Unparker};
use flume::{Receiver, RecvTimeoutError, SendError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use strand_core::cause::Cause;
use strand_core::effect::{Effect, Output};
use strand_core::exit::Exit;
use strand_core::fiber::Fiber;
use strand_core::id::FiberId;
use strand_core::platform::{Platform, ReportFailure, RuntimeConfig};
use strand_core::runtime::Runtime;
use strand_core::scheduler::{Scheduler, Task};
use strand_core::Shared;

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

#[cfg(test)]
mod tests;

/// Settings for a reactor that can be loaded from a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub threads: usize,
    pub thread_name: String,
    pub work_queue_limit: Option<usize>,
    pub runtime: RuntimeConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            thread_name: String::from("strand-reactor"),
            work_queue_limit: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

pub struct Builder {
    config: ReactorConfig,
    report_failure: Option<ReportFailure>,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(ReactorConfig::default())
    }

    #[must_use]
    pub fn from_config(config: ReactorConfig) -> Self {
        Self {
            config,
            report_failure: None,
        }
    }

    #[must_use]
    pub fn threads(mut self, thread_count: usize) -> Self {
        self.config.threads = thread_count;
        self
    }

    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn work_queue_limit(mut self, limit: usize) -> Self {
        self.config.work_queue_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.config.runtime = config;
        self
    }

    /// Replaces the function that fibers' unhandled failures are reported
    /// to.
    #[must_use]
    pub fn report_failure(
        mut self,
        report: impl Fn(&Cause<Shared>) + Send + Sync + 'static,
    ) -> Self {
        self.report_failure = Some(Arc::new(report));
        self
    }

    #[must_use]
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn finish(self) -> ReactorHandle {
        let (sender, receiver) = if let Some(limit) = self.config.work_queue_limit {
            flume::bounded(limit)
        } else {
            flume::unbounded()
        };

        let scheduler = Arc::new(ReactorScheduler {
            sender: sender.clone(),
        });
        let mut platform = Platform::new(scheduler).with_config(self.config.runtime);
        if let Some(report) = self.report_failure {
            platform = platform.with_report_failure(move |cause| report(cause));
        }

        let thread_count = self.config.threads.max(1);
        let handle = ReactorHandle {
            data: Arc::new(HandleData {
                sender,
                runtime: Runtime::new(platform),
                shared: Arc::new(SharedReactorData {
                    shutdown: AtomicBool::new(false),
                }),
                threads: Arc::default(),
                dispatcher: Mutex::default(),
            }),
        };

        let mut threads = Vec::with_capacity(thread_count);
        for num in 0..thread_count {
            let (spawner, tasks) = flume::unbounded();
            let parker = Parker::new();
            let data = Arc::new(PerThreadData::new(num, parker.unparker().clone()));
            let reactor = Reactor {
                receiver: tasks,
                shared: handle.data.shared.clone(),
            };
            let spawned = thread::Builder::new()
                .name(self.config.thread_name.clone())
                .spawn({
                    let data = data.clone();
                    move || reactor.run(&data, &parker)
                });
            match spawned {
                Ok(thread) => threads.push(PerThread {
                    data,
                    spawner,
                    handle: thread,
                }),
                Err(err) => warn!(thread = num, %err, "error spawning reactor thread"),
            }
        }

        *handle.data.threads.lock() = threads;

        let dispatcher = thread::Builder::new()
            .name(String::from("dispatcher"))
            .spawn({
                let threads = handle.data.threads.clone();
                move || Dispatcher::new(receiver, threads).run()
            });
        match dispatcher {
            Ok(dispatcher) => *handle.data.dispatcher.lock() = Some(dispatcher),
            Err(err) => warn!(%err, "error spawning dispatcher"),
        }

        handle
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards fiber work to the dispatcher thread.
struct ReactorScheduler {
    sender: Sender<Command>,
}

impl Scheduler for ReactorScheduler {
    fn dispatch(&self, task: Task) {
        if self.sender.send(Command::Dispatch(task)).is_err() {
            trace!("reactor shut down, dropping task");
        }
    }

    fn dispatch_at(&self, deadline: Instant, task: Task) {
        if self
            .sender
            .send(Command::DispatchAt(deadline, task))
            .is_err()
        {
            trace!("reactor shut down, dropping timer");
        }
    }
}

enum Command {
    Dispatch(Task),
    DispatchAt(Instant, Task),
    Shutdown,
}

struct DispatcherThread {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    num: usize,
    spawner: Sender<Task>,
    load: usize,
    unparker: Unparker,
}

struct Timer {
    deadline: Instant,
    task: Task,
}

struct Dispatcher {
    commands: Receiver<Command>,
    all_threads: Arc<Mutex<Vec<PerThread>>>,
    threads: VecDeque<DispatcherThread>,
    next_rebalance: Instant,
    timers: Lots<Timer>,
    timer_queue: VecDeque<LotId>,
}

impl Dispatcher {
    const REBALANCE_DELAY: Duration = Duration::from_millis(30);

    fn new(commands: Receiver<Command>, all_threads: Arc<Mutex<Vec<PerThread>>>) -> Self {
        let mut this = Self {
            commands,
            all_threads,
            threads: VecDeque::new(),
            next_rebalance: Instant::now(),
            timers: Lots::new(),
            timer_queue: VecDeque::new(),
        };
        this.cache_thread_loads(this.next_rebalance);
        this
    }

    fn cache_thread_loads(&mut self, now: Instant) {
        let threads = self.all_threads.lock();
        self.threads.clear();
        for t in &*threads {
            self.threads.push_back(DispatcherThread {
                num: t.data.num,
                spawner: t.spawner.clone(),
                load: t.spawner.len() * 2 + t.data.executing.load(Ordering::Relaxed),
                unparker: t.data.unparker.clone(),
            });
        }
        drop(threads);
        self.threads
            .make_contiguous()
            .sort_by_key(|thread| thread.load);
        self.next_rebalance = now + Self::REBALANCE_DELAY;
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timer_queue
            .iter()
            .find_map(|id| self.timers.get(*id))
            .map(|timer| timer.deadline)
    }

    fn run(mut self) {
        loop {
            let command = match self.next_deadline() {
                Some(deadline) => match self.commands.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(Command::Dispatch(task)) => self.dispatch(task),
                Some(Command::DispatchAt(deadline, task)) => self.schedule(deadline, task),
                Some(Command::Shutdown) => break,
                None => {}
            }

            self.fire_timers();
        }
        debug!(timers = self.timer_queue.len(), "dispatcher exiting");
    }

    fn dispatch(&mut self, mut task: Task) {
        // We loop in case a thread dies.
        loop {
            let Some(thread) = self.threads.front_mut() else {
                trace!("no reactor threads, dropping task");
                return;
            };

            match thread.spawner.send(task) {
                Ok(()) => {
                    trace!(thread = thread.num, "dispatch");
                    thread.unparker.unpark();
                    thread.load += 1;
                    let new_load = thread.load;
                    if let Some(next_load) = self
                        .threads
                        .get(1)
                        .and_then(|next| (next.load < new_load).then_some(next.load))
                    {
                        // Find the first thread that is busier than the new
                        // front of the queue and move the current thread in
                        // front of it.
                        match self
                            .threads
                            .iter()
                            .enumerate()
                            .skip(2)
                            .find_map(|(index, thread)| (next_load < thread.load).then_some(index))
                        {
                            Some(insert_at) => {
                                if let Some(current) = self.threads.pop_front() {
                                    self.threads.insert(insert_at, current);
                                }
                            }
                            None => self.threads.rotate_left(1),
                        }
                    }
                    break;
                }
                Err(SendError(returned)) => {
                    task = returned;
                    self.threads.pop_front();
                }
            }
        }

        let now = Instant::now();
        if now > self.next_rebalance {
            self.cache_thread_loads(now);
        }
    }

    fn schedule(&mut self, deadline: Instant, task: Task) {
        let position = self.find_timer_queue_position(deadline);
        let id = self.timers.push(Timer { deadline, task });
        self.timer_queue.insert(position, id);
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(id) = self.timer_queue.front().copied() {
            match self.timers.get(id) {
                Some(timer) if timer.deadline > now => break,
                Some(_) => {
                    self.timer_queue.pop_front();
                    if let Some(timer) = self.timers.remove(id) {
                        self.dispatch(timer.task);
                    }
                }
                None => {
                    self.timer_queue.pop_front();
                }
            }
        }
    }

    fn find_timer_queue_position(&self, deadline: Instant) -> usize {
        self.timer_queue
            .iter()
            .position(|id| {
                self.timers
                    .get(*id)
                    .is_some_and(|timer| timer.deadline > deadline)
            })
            .unwrap_or(self.timer_queue.len())
    }
}

/// A worker thread of a reactor.
pub struct Reactor {
    receiver: Receiver<Task>,
    shared: Arc<SharedReactorData>,
}

impl Reactor {
    /// Returns a handle to a new reactor with the default settings.
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new() -> ReactorHandle {
        Self::build().finish()
    }

    #[must_use]
    pub fn build() -> Builder {
        Builder::new()
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn run(self, data: &PerThreadData, parker: &Parker) {
        'outer: while !self.shared.shutdown.load(Ordering::Relaxed) {
            loop {
                match self.receiver.try_recv() {
                    Ok(task) => {
                        data.executing.store(1, Ordering::Relaxed);
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                            let defect = strand_core::Defect::from_panic(payload);
                            warn!(thread = data.num, %defect, "task panicked");
                        }
                        data.executing.store(0, Ordering::Relaxed);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
                if self.shared.shutdown.load(Ordering::Relaxed) {
                    break 'outer;
                }
            }

            parker.park();
        }
        trace!(thread = data.num, "reactor thread exiting");
    }
}

#[derive(Debug)]
pub struct ReactorShutdown;

impl Display for ReactorShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the reactor has shut down")
    }
}

impl std::error::Error for ReactorShutdown {}

pub struct ReactorHandle {
    data: Arc<HandleData>,
}

impl ReactorHandle {
    /// Returns the runtime whose fibers execute on this reactor.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.data.runtime
    }

    /// Starts `effect` on a new root fiber.
    pub fn spawn<A, E>(&self, effect: Effect<A, E>) -> Result<TaskHandle<A, E>, ReactorShutdown>
    where
        A: Output,
        E: Output,
    {
        if self.data.shared.shutdown.load(Ordering::Relaxed) {
            return Err(ReactorShutdown);
        }
        let result = ResultHandle::default();
        let fiber = self.data.runtime.run(effect, {
            let result = result.clone();
            move |exit| result.send(exit)
        });
        trace!(task = %fiber.id(), "spawned");
        Ok(TaskHandle { fiber, result })
    }

    /// Runs `effect` on a new root fiber and blocks the current thread until
    /// it exits.
    pub fn block_on<A, E>(&self, effect: Effect<A, E>) -> Result<Exit<A, E>, ReactorShutdown>
    where
        A: Output,
        E: Output,
    {
        self.spawn(effect).map(|task| task.join())
    }

    pub fn shutdown(&self) -> Result<(), Box<dyn Any + Send + 'static>> {
        if self
            .data
            .shared
            .shutdown
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            debug!("shutting down reactor");
            let _result = self.data.sender.send(Command::Shutdown);
            let mut threads = self.data.threads.lock();
            for thread in &*threads {
                thread.data.unparker.unpark();
            }
            while let Some(thread) = threads.pop() {
                thread.handle.join()?;
            }
            drop(threads);
            if let Some(dispatcher) = self.data.dispatcher.lock().take() {
                dispatcher.join()?;
            }
        }
        Ok(())
    }
}

impl Clone for ReactorHandle {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("shared", &self.data.shared)
            .field("threads", &self.data.threads.lock().len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SharedReactorData {
    shutdown: AtomicBool,
}

#[derive(Debug)]
struct PerThread {
    spawner: Sender<Task>,
    handle: JoinHandle<()>,
    data: Arc<PerThreadData>,
}

#[derive(Debug)]
struct PerThreadData {
    num: usize,
    unparker: Unparker,
    executing: AtomicUsize,
}

impl PerThreadData {
    fn new(num: usize, unparker: Unparker) -> Self {
        Self {
            num,
            unparker,
            executing: AtomicUsize::new(0),
        }
    }
}

struct HandleData {
    sender: Sender<Command>,
    runtime: Runtime,
    threads: Arc<Mutex<Vec<PerThread>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<SharedReactorData>,
}

struct ResultHandle<T>(Arc<ResultHandleData<T>>);

impl<T> ResultHandle<T>
where
    T: Clone,
{
    fn send(&self, result: T) {
        let mut data = self.0.locked.lock();
        data.result = Some(result);
        for waker in data.wakers.drain(..) {
            waker.wake();
        }
        drop(data);
        self.0.sync.notify_all();
    }

    fn recv<Deadline>(&self, deadline: Deadline) -> Deadline::Result
    where
        Deadline: ResultDeadline<T>,
    {
        let mut data = self.0.locked.lock();
        loop {
            if let Some(result) = &data.result {
                return deadline.result(result.clone());
            } else if !deadline.wait(&self.0.sync, &mut data) {
                return deadline.cancelled_result();
            }
        }
    }

    fn try_recv(&self) -> Option<T> {
        self.0.locked.lock().result.clone()
    }
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for ResultHandle<T> {
    fn default() -> Self {
        Self(Arc::new(ResultHandleData {
            sync: Condvar::new(),
            locked: Mutex::new(ResultHandleResult {
                result: None,
                wakers: Vec::new(),
            }),
        }))
    }
}

impl<T> Debug for ResultHandle<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("ResultHandle");

        if let Some(data) = self.0.locked.try_lock() {
            f.field(&data.result);
        }

        f.finish()
    }
}

trait ResultDeadline<T> {
    type Result;

    fn wait<G>(&self, sync: &Condvar, mutex_guard: &mut MutexGuard<'_, G>) -> bool;
    fn result(&self, result: T) -> Self::Result;
    fn cancelled_result(&self) -> Self::Result;
}

impl<T> ResultDeadline<T> for () {
    type Result = T;

    fn wait<G>(&self, sync: &Condvar, mutex_guard: &mut MutexGuard<'_, G>) -> bool {
        sync.wait(mutex_guard);
        true
    }

    fn result(&self, result: T) -> Self::Result {
        result
    }

    fn cancelled_result(&self) -> Self::Result {
        unreachable!("waiting without a deadline never times out")
    }
}

impl<T> ResultDeadline<T> for Instant {
    type Result = Option<T>;

    fn wait<G>(&self, sync: &Condvar, mutex_guard: &mut MutexGuard<'_, G>) -> bool {
        !sync.wait_until(mutex_guard, *self).timed_out()
    }

    fn result(&self, result: T) -> Self::Result {
        Some(result)
    }

    fn cancelled_result(&self) -> Self::Result {
        None
    }
}

struct ResultHandleData<T> {
    sync: Condvar,
    locked: Mutex<ResultHandleResult<T>>,
}

struct ResultHandleResult<T> {
    result: Option<T>,
    wakers: Vec<Waker>,
}

/// A handle to an effect running on a reactor.
pub struct TaskHandle<A, E> {
    fiber: Fiber<A, E>,
    result: ResultHandle<Exit<A, E>>,
}

impl<A, E> TaskHandle<A, E>
where
    A: Output,
    E: Output,
{
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Returns the fiber executing this task.
    #[must_use]
    pub const fn fiber(&self) -> &Fiber<A, E> {
        &self.fiber
    }

    pub fn join(&self) -> Exit<A, E> {
        self.result.recv(())
    }

    #[must_use]
    pub fn try_join(&self) -> Option<Exit<A, E>> {
        self.result.try_recv()
    }

    #[must_use]
    pub fn try_join_until(&self, deadline: Instant) -> Option<Exit<A, E>> {
        self.result.recv(deadline)
    }

    #[must_use]
    pub fn try_join_for(&self, duration: Duration) -> Option<Exit<A, E>> {
        self.try_join_until(Instant::now() + duration)
    }

    /// Requests that the task's fiber be interrupted. The task still has to
    /// be joined to observe its exit.
    pub fn cancel(&self) {
        self.fiber.cancel();
    }
}

impl<A, E> Future for &'_ TaskHandle<A, E>
where
    A: Clone,
    E: Clone,
{
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut data = self.result.0.locked.lock();
        if let Some(result) = &data.result {
            Poll::Ready(result.clone())
        } else {
            let will_wake = data.wakers.iter().any(|w| w.will_wake(cx.waker()));
            if !will_wake {
                data.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

impl<A, E> Debug for TaskHandle<A, E>
where
    A: Debug,
    E: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("fiber", &self.fiber)
            .field("result", &self.result)
            .finish()
    }
}
