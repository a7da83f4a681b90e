//! Fibers and the interpreter that executes them.
//!
//! A fiber executes a single [`Effect`](crate::effect::Effect) one
//! instruction at a time. Pending continuations are kept on an explicit
//! stack owned by the fiber, which lets execution stop at any asynchronous
//! boundary and resume later on any thread.
//!
//! Each fiber has two pieces of state:
//!
//! - The *local* state: the continuation stack, the region stacks and the
//!   fiber's [`FiberRef`](crate::fiber_ref::FiberRef) values. Only the
//!   fiber's own execution touches it.
//! - The *shared* state: the [`Status`], the observers waiting for the fiber
//!   to exit and the accumulated interruption cause. Other fibers update it
//!   when they interrupt or await this fiber.
//!
//! When both are needed, the local state is always locked first. Observers
//! and scheduled work are always invoked after the shared state is unlocked.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kempt::Set;
use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber_ref::FiberRefs;
use crate::id::FiberId;
use crate::instruction::{
    share_exit, AnyValue, ErasedCause, ErasedExit, FailureHandler, Frame, Instruction,
    InterruptStatus, RaceContinuation, RaceWith, Register, RegionExit, Shared,
};
use crate::platform::{Platform, ReportFailure};
use crate::scope::Scope;
use crate::stack::LinkedStack;
use crate::supervisor::Supervisor;

mod handle;
mod state;

pub(crate) use handle::{typed_exit, Resume};
pub use handle::{Callback, Fiber, RuntimeFiber};
use state::{Canceller, FiberState, Observer};
pub use state::Status;

/// A snapshot of a fiber, observed from within the fiber.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// The id of the fiber.
    pub id: FiberId,
    /// The status of the fiber when the snapshot was taken.
    pub status: Status,
    /// The fibers that have requested this fiber be interrupted.
    pub interruptors: Set<FiberId>,
    /// The interrupt status of the region the snapshot was taken in.
    pub interrupt_status: InterruptStatus,
    /// The scope the fiber closes when it exits.
    pub scope: Scope,
}

/// The most recent instructions a fiber executed while tracing was enabled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Trace {
    /// The traced fiber.
    pub fiber: FiberId,
    /// Instruction names, oldest first.
    pub instructions: Vec<&'static str>,
}

pub(crate) struct FiberContext {
    id: FiberId,
    platform: Platform,
    scope: Scope,
    interrupt_requested: AtomicBool,
    state: Mutex<FiberState>,
    local: Mutex<FiberLocal>,
}

pub(crate) struct FiberLocal {
    stack: LinkedStack<Frame>,
    interrupt_status: LinkedStack<InterruptStatus>,
    tracing: LinkedStack<bool>,
    environments: LinkedStack<Shared>,
    supervisors: LinkedStack<Option<Arc<dyn Supervisor>>>,
    fork_scopes: LinkedStack<Scope>,
    fiber_refs: FiberRefs,
    async_epoch: u64,
    op_count: usize,
    trace: VecDeque<&'static str>,
}

impl FiberLocal {
    fn root() -> Self {
        Self {
            stack: LinkedStack::new(),
            interrupt_status: LinkedStack::new(),
            tracing: LinkedStack::new(),
            environments: LinkedStack::new(),
            supervisors: LinkedStack::new(),
            fork_scopes: LinkedStack::new(),
            fiber_refs: FiberRefs::default(),
            async_epoch: 0,
            op_count: 0,
            trace: VecDeque::new(),
        }
    }

    fn child(&self) -> Self {
        let mut child = Self::root();
        child.interrupt_status.push(self.interrupt_status());
        child.tracing.push(self.tracing_enabled());
        if let Some(environment) = self.environments.peek() {
            child.environments.push(environment.clone());
        }
        if let Some(supervisor) = self.supervisor() {
            child.supervisors.push(Some(supervisor));
        }
        child.fiber_refs = self.fiber_refs.forked();
        child
    }

    fn interrupt_status(&self) -> InterruptStatus {
        self.interrupt_status
            .peek_or(InterruptStatus::Interruptible)
    }

    fn tracing_enabled(&self) -> bool {
        self.tracing.peek_or(true)
    }

    fn supervisor(&self) -> Option<Arc<dyn Supervisor>> {
        self.supervisors.peek().cloned().flatten()
    }

    fn exit_region(&mut self, region: RegionExit) {
        match region {
            RegionExit::Interrupt => {
                self.interrupt_status.pop();
            }
            RegionExit::Tracing => {
                self.tracing.pop();
            }
            RegionExit::Environment => {
                self.environments.pop();
            }
            RegionExit::Supervisor => {
                self.supervisors.pop();
            }
            RegionExit::ForkScope => {
                self.fork_scopes.pop();
            }
        }
    }

    fn enter_region(&mut self, region: RegionExit) {
        self.stack.push(Frame::Exit(region));
    }

    fn record(&mut self, instruction: &'static str, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.trace.len() >= capacity {
            self.trace.pop_front();
        }
        self.trace.push_back(instruction);
    }
}

impl FiberContext {
    fn new(platform: Platform, local: FiberLocal) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            platform,
            scope: Scope::open(),
            interrupt_requested: AtomicBool::new(false),
            state: Mutex::new(FiberState::new()),
            local: Mutex::new(local),
        })
    }

    /// Returns a new fiber that isn't a child of any other fiber.
    pub fn root(platform: Platform) -> Arc<Self> {
        Self::new(platform, FiberLocal::root())
    }

    pub const fn id(&self) -> FiberId {
        self.id
    }

    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn status(&self) -> Status {
        self.state.lock().status()
    }

    pub fn poll(&self) -> Option<ErasedExit> {
        match &*self.state.lock() {
            FiberState::Executing { .. } => None,
            FiberState::Done { exit, .. } => Some(exit.clone()),
        }
    }

    /// Registers `observer` to be invoked when this fiber exits, returning
    /// the key that removes it again. If the fiber has already exited, the
    /// observer is returned along with the exit instead.
    fn observe(&self, observer: Observer) -> Result<u64, (Observer, ErasedExit)> {
        match &mut *self.state.lock() {
            FiberState::Executing {
                observers,
                next_observer,
                ..
            } => {
                *next_observer += 1;
                observers.insert(*next_observer, observer);
                Ok(*next_observer)
            }
            FiberState::Done { exit, .. } => Err((observer, exit.clone())),
        }
    }

    /// Removes an observer registered with [`Self::observe`] that hasn't
    /// been invoked yet.
    fn remove_observer(&self, key: u64) {
        let removed = match &mut *self.state.lock() {
            FiberState::Executing { observers, .. } => observers.remove(&key),
            FiberState::Done { .. } => None,
        };
        drop(removed);
    }

    /// Invokes `observer` when this fiber exits, immediately if it already
    /// has.
    pub fn on_done(&self, observer: Observer) {
        if let Err((observer, exit)) = self.observe(observer) {
            observer(exit);
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        match &*self.state.lock() {
            FiberState::Executing { observers, .. } => observers.len(),
            FiberState::Done { .. } => 0,
        }
    }

    /// Schedules `instruction` to be executed by this fiber.
    pub fn evaluate_later(self: &Arc<Self>, instruction: Instruction) {
        let fiber = self.clone();
        self.platform
            .scheduler()
            .dispatch(Box::new(move || fiber.evaluate_now(instruction)));
    }

    /// Executes `instruction` on the current thread until the fiber
    /// suspends, yields or exits.
    pub fn evaluate_now(self: &Arc<Self>, instruction: Instruction) {
        let mut local = self.local.lock();
        local.op_count = 0;
        let mut next = Some(instruction);
        while let Some(instruction) = next.take() {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| self.run(&mut local, instruction)))
            {
                next = Some(Instruction::die(Defect::from_panic(payload)));
            }
        }
    }

    fn run(self: &Arc<Self>, local: &mut FiberLocal, instruction: Instruction) {
        let budget = self.platform.yield_op_count();
        let trace_capacity = self.platform.config().trace_capacity;
        let mut current = Some(instruction);
        while let Some(instruction) = current.take() {
            if local.op_count >= budget {
                trace!(fiber = %self.id, "yielding");
                self.evaluate_later(instruction);
                return;
            }

            let instruction = if self.should_interrupt(local) {
                self.set_interrupting(true);
                Instruction::Fail(self.interrupted_cause().lift())
            } else {
                instruction
            };

            local.op_count = local.op_count.saturating_add(1);
            if local.tracing_enabled() {
                local.record(instruction.tag(), trace_capacity);
            }
            current = self.step(local, instruction);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        self: &Arc<Self>,
        local: &mut FiberLocal,
        instruction: Instruction,
    ) -> Option<Instruction> {
        match instruction {
            Instruction::Succeed(value) => self.next_instr(local, value),
            Instruction::Sync(effect) => self.next_instr(local, effect()),
            Instruction::Partial(effect) => match effect() {
                Ok(value) => self.next_instr(local, value),
                Err(error) => Some(Instruction::Fail(Cause::fail(error))),
            },
            Instruction::Fail(cause) => self.unwind(local, cause),
            Instruction::Suspend(effect) => Some(effect()),
            Instruction::FlatMap(effect, continuation) => match *effect {
                Instruction::Succeed(value) => Some(continuation(value)),
                Instruction::Sync(effect) => Some(continuation(effect())),
                Instruction::Partial(effect) => Some(match effect() {
                    Ok(value) => continuation(value),
                    Err(error) => Instruction::Fail(Cause::fail(error)),
                }),
                effect => {
                    local.stack.push(Frame::Apply(continuation));
                    Some(effect)
                }
            },
            Instruction::Fold {
                effect,
                failure,
                success,
            } => {
                local.stack.push(Frame::Fold { failure, success });
                Some(*effect)
            }
            Instruction::CatchCause { effect, failure } => {
                local.stack.push(Frame::Handler(failure));
                Some(*effect)
            }
            Instruction::SetInterruptStatus { effect, status } => {
                local.interrupt_status.push(status);
                local.enter_region(RegionExit::Interrupt);
                Some(*effect)
            }
            Instruction::CheckInterrupt(check) => Some(check(local.interrupt_status())),
            Instruction::Async {
                register,
                blocking_on,
            } => self.suspend(local, register, blocking_on),
            Instruction::Fork {
                effect,
                scope,
                report_failure,
            } => {
                let child = self.fork(local, *effect, scope, report_failure);
                self.next_instr(local, Box::new(RuntimeFiber::new(child)))
            }
            Instruction::RaceWith(race) => Some(self.race_with(local, *race)),
            Instruction::Descriptor(with) => Some(with(self.descriptor(local))),
            Instruction::Yield => {
                local.op_count = usize::MAX;
                self.next_instr(local, Box::new(()))
            }
            Instruction::Access(with) => Some(with(local.environments.peek().cloned())),
            Instruction::Provide {
                environment,
                effect,
            } => {
                local.environments.push(environment);
                local.enter_region(RegionExit::Environment);
                Some(*effect)
            }
            Instruction::SetTracing { enabled, effect } => {
                local.tracing.push(enabled);
                local.enter_region(RegionExit::Tracing);
                Some(*effect)
            }
            Instruction::Trace(with) => Some(with(Trace {
                fiber: self.id,
                instructions: local.trace.iter().copied().collect(),
            })),
            Instruction::Supervise { supervisor, effect } => {
                local.supervisors.push(supervisor);
                local.enter_region(RegionExit::Supervisor);
                Some(*effect)
            }
            Instruction::GetForkScope(with) => Some(with(
                local
                    .fork_scopes
                    .peek()
                    .cloned()
                    .unwrap_or_else(|| self.scope.clone()),
            )),
            Instruction::OverrideForkScope { scope, effect } => {
                local.fork_scopes.push(scope);
                local.enter_region(RegionExit::ForkScope);
                Some(*effect)
            }
            Instruction::WithFiberRefs(with) => Some(with(&mut local.fiber_refs)),
        }
    }

    /// Pops frames until one accepts `value`.
    fn next_instr(
        self: &Arc<Self>,
        local: &mut FiberLocal,
        value: AnyValue,
    ) -> Option<Instruction> {
        loop {
            match local.stack.pop() {
                Some(Frame::Apply(continuation) | Frame::Fold {
                    success: continuation,
                    ..
                }) => return Some(continuation(value)),
                Some(Frame::Handler(_)) => {}
                Some(Frame::Exit(region)) => local.exit_region(region),
                None => return self.complete(&local.fiber_refs, share_exit(Exit::Success(value))),
            }
        }
    }

    /// Pops frames until one can handle a failure. Handlers are discarded
    /// while the fiber should be interrupted.
    fn unwind_stack(&self, local: &mut FiberLocal) -> (Option<FailureHandler>, bool) {
        let mut discarded = false;
        while let Some(frame) = local.stack.pop() {
            match frame {
                Frame::Exit(region) => local.exit_region(region),
                Frame::Fold { failure, .. } | Frame::Handler(failure) => {
                    if self.should_interrupt(local) {
                        discarded = true;
                    } else {
                        return (Some(failure), discarded);
                    }
                }
                Frame::Apply(_) => {}
            }
        }
        (None, discarded)
    }

    fn unwind(self: &Arc<Self>, local: &mut FiberLocal, cause: ErasedCause) -> Option<Instruction> {
        let (handler, discarded) = self.unwind_stack(local);
        let cause = if discarded {
            cause.strip_failures()
        } else {
            cause
        };

        if let Some(handler) = handler {
            self.set_interrupting(false);
            return Some(handler(cause));
        }

        let interrupted = self.interrupted_cause();
        let cause = if cause.contains_interruptions_of(&interrupted) {
            cause
        } else {
            cause.then(interrupted.lift())
        };
        self.set_interrupting(true);
        self.complete(&local.fiber_refs, share_exit(Exit::Failure(cause)))
    }

    /// Attempts to finish this fiber with `exit`. `refs` are the fiber's
    /// fiber-local values, kept for fibers that join this one later.
    ///
    /// The fiber only exits once its own scope is closed. If the scope is
    /// still open, the returned instruction closes it and then completes the
    /// fiber again. Completing a fiber that has already exited does nothing.
    pub fn complete(self: &Arc<Self>, refs: &FiberRefs, exit: ErasedExit) -> Option<Instruction> {
        let scope_closed = self.scope.is_closed();
        let mut state = self.state.lock();
        let FiberState::Executing {
            status, observers, ..
        } = &mut *state
        else {
            return None;
        };

        if !scope_closed {
            *status = Status::Finishing { interrupting: true };
            drop(state);
            return Some(self.close_scope(exit));
        }

        let observers = std::mem::take(observers);
        *state = FiberState::Done {
            exit: exit.clone(),
            refs: refs.clone(),
        };
        drop(state);

        debug!(fiber = %self.id, success = exit.is_success(), "fiber exited");
        if let Exit::Failure(cause) = &exit {
            if !cause.interrupted_only() {
                self.platform.report_failure(cause);
            }
        }
        for observer in observers.into_iter().map(|field| field.into_parts().1) {
            let exit = exit.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || observer(exit))) {
                self.platform
                    .report_failure(&Cause::die(Defect::from_panic(payload)));
            }
        }
        None
    }

    fn close_scope(&self, exit: ErasedExit) -> Instruction {
        let close = self.scope.close(exit.clone()).into_instruction();
        let on_failure = exit.clone();
        Instruction::Fold {
            effect: Box::new(close),
            failure: Box::new(move |cause: ErasedCause| {
                let cause = cause.try_map(&mut |_| {
                    Err(Defect::new("scope finalizer failed with a typed error"))
                });
                Instruction::done(match on_failure {
                    Exit::Success(_) => Exit::Failure(cause),
                    Exit::Failure(original) => Exit::Failure(original.then(cause)),
                })
            }),
            success: Box::new(move |_| Instruction::done(exit)),
        }
        .with_interrupt_status(InterruptStatus::Uninterruptible)
    }

    fn should_interrupt(&self, local: &FiberLocal) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
            && local.interrupt_status().is_interruptible()
            && !self.is_interrupting()
    }

    fn is_interrupting(&self) -> bool {
        match &*self.state.lock() {
            FiberState::Executing { status, .. } => status.is_interrupting(),
            FiberState::Done { .. } => false,
        }
    }

    fn set_interrupting(&self, interrupting: bool) {
        if let FiberState::Executing { status, .. } = &mut *self.state.lock() {
            let current = std::mem::replace(status, Status::Done);
            *status = current.with_interrupting(interrupting);
        }
    }

    fn interrupted_cause(&self) -> Cause<Infallible> {
        self.state.lock().interrupted()
    }

    /// Records an interruption by `by`. A suspended, interruptible fiber is
    /// woken so that the interruption is applied without waiting for its
    /// asynchronous callback, and the suspension's canceller runs.
    pub fn kill(self: &Arc<Self>, by: FiberId) {
        let mut state = self.state.lock();
        let FiberState::Executing {
            status,
            interrupted,
            canceller,
            ..
        } = &mut *state
        else {
            return;
        };
        *interrupted = std::mem::take(interrupted).then(Cause::interrupt(by));
        self.interrupt_requested.store(true, Ordering::Release);

        let wake = matches!(
            status,
            Status::Suspended {
                interruptible: true,
                ..
            }
        ) && !status.is_interrupting();
        if !wake {
            trace!(fiber = %self.id, %by, "interruption recorded");
            return;
        }

        if let Status::Suspended { previous, .. } = std::mem::replace(status, Status::Done) {
            *status = previous.with_interrupting(true);
        }
        let cause = interrupted.clone();
        let cancel = canceller.take();
        drop(state);
        debug!(fiber = %self.id, %by, "interrupting suspended fiber");
        if let Some(cancel) = cancel {
            cancel();
        }
        self.evaluate_later(Instruction::Fail(cause.lift()));
    }

    /// Returns an instruction that interrupts this fiber and then waits for
    /// it to exit.
    pub fn interrupt_as(self: &Arc<Self>, by: FiberId) -> Instruction {
        let fiber = self.clone();
        Instruction::Suspend(Box::new(move || {
            fiber.kill(by);
            fiber.await_exit()
        }))
    }

    /// Returns an instruction that waits for this fiber to exit and produces
    /// its [`ErasedExit`].
    pub fn await_exit(self: &Arc<Self>) -> Instruction {
        let fiber = self.clone();
        Instruction::Async {
            register: Box::new(move |resume: Resume| {
                let waiting = resume.clone();
                let observer: Observer = Box::new(move |exit| {
                    waiting.resume(Instruction::succeed(exit));
                });
                match fiber.observe(observer) {
                    Ok(key) => {
                        resume.on_interrupt(Box::new(move || fiber.remove_observer(key)));
                        None
                    }
                    Err((_, exit)) => Some(Instruction::succeed(exit)),
                }
            }),
            blocking_on: vec![self.id],
        }
    }

    /// Returns an instruction that joins this fiber's
    /// [`FiberRef`](crate::fiber_ref::FiberRef) values, as they were when it
    /// exited, into the executing fiber's values. Dies if this fiber hasn't
    /// exited.
    pub fn inherit_refs(self: &Arc<Self>) -> Instruction {
        let child = self.clone();
        Instruction::WithFiberRefs(Box::new(move |refs| {
            let exited = match &*child.state.lock() {
                FiberState::Done { refs: exited, .. } => Some(exited.clone()),
                FiberState::Executing { .. } => None,
            };
            match exited {
                Some(child_refs) => {
                    refs.join(&child_refs);
                    Instruction::unit()
                }
                None => Instruction::die(Defect::new(
                    "fiber refs can only be inherited from a fiber that has exited",
                )),
            }
        }))
    }

    fn suspend(
        self: &Arc<Self>,
        local: &mut FiberLocal,
        register: Register,
        blocking_on: Vec<FiberId>,
    ) -> Option<Instruction> {
        let epoch = local.async_epoch;
        local.async_epoch += 1;
        self.enter_async(
            epoch,
            local.interrupt_status().is_interruptible(),
            blocking_on,
        );

        if self.should_interrupt(local) {
            return self.exit_async(epoch).then(|| {
                self.set_interrupting(true);
                Instruction::Fail(self.interrupted_cause().lift())
            });
        }

        let resume = Resume::new(self.clone(), epoch);
        match panic::catch_unwind(AssertUnwindSafe(move || register(resume))) {
            Ok(Some(instruction)) => self.exit_async(epoch).then_some(instruction),
            Ok(None) => None,
            Err(payload) => self
                .exit_async(epoch)
                .then(|| Instruction::die(Defect::from_panic(payload))),
        }
    }

    fn enter_async(&self, epoch: u64, interruptible: bool, blocking_on: Vec<FiberId>) {
        if let FiberState::Executing {
            status, canceller, ..
        } = &mut *self.state.lock()
        {
            *canceller = None;
            let previous = std::mem::replace(status, Status::Done);
            *status = Status::Suspended {
                previous: Box::new(previous),
                interruptible,
                epoch,
                blocking_on,
            };
        }
    }

    /// Leaves the suspension started at `epoch`. Returns false if the fiber
    /// already left it, in which case the caller must not resume the fiber.
    pub fn exit_async(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        let FiberState::Executing {
            status, canceller, ..
        } = &mut *state
        else {
            return false;
        };
        let suspended = matches!(
            status,
            Status::Suspended { epoch: current, .. } if *current == epoch
        );
        if !suspended {
            return false;
        }
        if let Status::Suspended { previous, .. } = std::mem::replace(status, Status::Done) {
            *status = *previous;
        }
        let stale = canceller.take();
        drop(state);
        drop(stale);
        true
    }

    /// Stores `cancel` to run if this fiber is woken from the suspension
    /// started at `epoch` by an interruption. If the fiber already left that
    /// suspension, `cancel` is handed back.
    pub fn set_canceller(&self, epoch: u64, cancel: Canceller) -> Option<Canceller> {
        match &mut *self.state.lock() {
            FiberState::Executing {
                status: Status::Suspended { epoch: current, .. },
                canceller,
                ..
            } if *current == epoch => {
                *canceller = Some(cancel);
                None
            }
            _ => Some(cancel),
        }
    }

    fn descriptor(&self, local: &FiberLocal) -> Descriptor {
        let state = self.state.lock();
        Descriptor {
            id: self.id,
            status: state.status(),
            interruptors: state.interrupted().interruptors(),
            interrupt_status: local.interrupt_status(),
            scope: self.scope.clone(),
        }
    }

    fn fork(
        self: &Arc<Self>,
        local: &FiberLocal,
        effect: Instruction,
        scope: Option<Scope>,
        report_failure: Option<ReportFailure>,
    ) -> Arc<FiberContext> {
        let platform = match report_failure {
            Some(report) => self.platform.clone().with_reporter(report),
            None => self.platform.clone(),
        };
        let scope = scope
            .or_else(|| local.fork_scopes.peek().cloned())
            .unwrap_or_else(|| self.scope.clone());
        let child = FiberContext::new(platform, local.child());
        trace!(fiber = %child.id, parent = %self.id, daemon = scope.is_global(), "forked");

        if let Some(supervisor) = local.supervisor() {
            supervisor.on_start(&RuntimeFiber::new(child.clone()));
            let id = child.id;
            child.on_done(Box::new(move |exit| supervisor.on_end(id, &exit)));
        }

        if scope.is_global() {
            if let Some(daemons) = self.platform.daemons() {
                daemons.register(&RuntimeFiber::new(child.clone()));
            }
        } else {
            let target = child.clone();
            let parent = self.id;
            let key = scope.add_finalizer(move |_| {
                Effect::<ErasedExit>::from_instruction(target.interrupt_as(parent)).discard()
            });
            match key {
                Some(key) => {
                    let scope = scope.clone();
                    child.on_done(Box::new(move |_| {
                        scope.remove_finalizer(key);
                    }));
                }
                None => child.kill(parent),
            }
        }

        child.evaluate_later(effect);
        child
    }

    fn race_with(self: &Arc<Self>, local: &FiberLocal, race: RaceWith) -> Instruction {
        let RaceWith {
            left,
            right,
            left_wins,
            right_wins,
            scope,
        } = race;
        let left = self.fork(
            local,
            left.with_interrupt_status(InterruptStatus::Interruptible),
            scope.clone(),
            None,
        );
        let right = self.fork(
            local,
            right.with_interrupt_status(InterruptStatus::Interruptible),
            scope,
            None,
        );
        let blocking_on = vec![left.id, right.id];
        Instruction::Async {
            register: Box::new(move |resume: Resume| {
                let decided = Arc::new(AtomicBool::new(false));
                Self::arm_racer(&left, &right, left_wins, decided.clone(), resume.clone());
                Self::arm_racer(&right, &left, right_wins, decided, resume);
                None
            }),
            blocking_on,
        }
    }

    fn arm_racer(
        racer: &Arc<FiberContext>,
        opponent: &Arc<FiberContext>,
        wins: RaceContinuation,
        decided: Arc<AtomicBool>,
        resume: Resume,
    ) {
        let winner = racer.clone();
        let loser = opponent.clone();
        racer.on_done(Box::new(move |exit| {
            if decided
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let loser = RuntimeFiber::new(loser);
            let next = if exit.is_success() {
                winner
                    .inherit_refs()
                    .flat_map(Box::new(move |_| wins(exit, loser)))
            } else {
                Instruction::Suspend(Box::new(move || wins(exit, loser)))
            };
            resume.resume(next);
        }));
    }
}
