//! Typed descriptions of work for fibers to execute.
//!
//! An [`Effect<A, E>`] describes a computation that either produces an `A`,
//! fails with an `E`, dies with a [`Defect`] or is interrupted. Building an
//! effect does nothing; it only runs once a fiber interprets it.
//!
//! ```rust
//! use std::convert::Infallible;
//!
//! use strand_core::effect::Effect;
//! use strand_core::exit::Exit;
//! use strand_core::scheduler::CurrentThread;
//!
//! let program = Effect::<u32, Infallible>::succeed(20)
//!     .zip_with(Effect::sync(|| 22), |a, b| a + b);
//! let exit = CurrentThread::new().block_on(program);
//! assert_eq!(exit, Exit::Success(42));
//! ```

use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::{Callback, Descriptor, Trace};
use crate::id::FiberId;
use crate::instruction::{downcast, share, AnyValue, Instruction, InterruptStatus};
use crate::scope::Scope;
use crate::supervisor::Supervisor;

mod concurrent;
mod resource;

pub use resource::Restore;

/// A value that can be shared with every observer of a fiber.
///
/// Forked and spawned effects must produce values and errors that implement
/// this trait, since a fiber's exit can be observed more than once.
pub trait Output: Clone + Send + Sync + 'static {}

impl<T> Output for T where T: Clone + Send + Sync + 'static {}

/// A description of a computation that produces an `A` or fails with an
/// `E`.
#[must_use = "effects do nothing until a fiber runs them"]
pub struct Effect<A, E = Infallible> {
    instruction: Instruction,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E> {
    pub(crate) const fn from_instruction(instruction: Instruction) -> Self {
        Self {
            instruction,
            _types: PhantomData,
        }
    }

    pub(crate) fn into_instruction(self) -> Instruction {
        self.instruction
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Returns an effect that produces `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_instruction(Instruction::succeed(value))
    }

    /// Returns an effect that produces the result of invoking `effect`.
    pub fn sync(effect: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_instruction(Instruction::Sync(Box::new(move || {
            Box::new(effect()) as AnyValue
        })))
    }

    /// Returns an effect that invokes `effect`, succeeding with its `Ok`
    /// value or failing with its `Err` value.
    pub fn attempt(effect: impl FnOnce() -> Result<A, E> + Send + 'static) -> Self {
        Self::from_instruction(Instruction::Partial(Box::new(move || {
            effect()
                .map(|value| Box::new(value) as AnyValue)
                .map_err(|error| Box::new(error) as AnyValue)
        })))
    }

    /// Returns an effect that fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// Returns an effect that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instruction(Instruction::Fail(
            cause.map(|error| Box::new(error) as AnyValue),
        ))
    }

    /// Returns an effect that dies with `defect`.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::from_instruction(Instruction::die(defect))
    }

    /// Returns an effect that finishes the same way `exit` did.
    pub fn done(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(value) => Self::succeed(value),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// Returns an effect that is built by `effect` when it is executed.
    pub fn suspend(effect: impl FnOnce() -> Self + Send + 'static) -> Self {
        Self::from_instruction(Instruction::Suspend(Box::new(move || effect().instruction)))
    }

    /// Returns an effect that suspends the fiber until `register` or a
    /// clone of the [`Callback`] it receives is completed.
    pub fn async_effect(register: impl FnOnce(Callback<A, E>) + Send + 'static) -> Self {
        Self::async_blocking_on(Vec::new(), register)
    }

    /// Returns an asynchronous effect whose suspended fiber reports that it
    /// is waiting on `blocking_on`.
    pub fn async_blocking_on(
        blocking_on: Vec<FiberId>,
        register: impl FnOnce(Callback<A, E>) + Send + 'static,
    ) -> Self {
        Self::from_instruction(Instruction::Async {
            register: Box::new(move |resume| {
                register(Callback::new(resume));
                None
            }),
            blocking_on,
        })
    }

    /// Returns an asynchronous effect that completes immediately if
    /// `register` returns an effect.
    pub fn async_maybe(
        register: impl FnOnce(Callback<A, E>) -> Option<Self> + Send + 'static,
    ) -> Self {
        Self::from_instruction(Instruction::Async {
            register: Box::new(move |resume| {
                register(Callback::new(resume)).map(Effect::into_instruction)
            }),
            blocking_on: Vec::new(),
        })
    }

    /// Returns an effect that never completes unless interrupted.
    pub fn never() -> Self {
        Self::from_instruction(Instruction::Async {
            register: Box::new(|_| None),
            blocking_on: Vec::new(),
        })
    }

    /// Returns an effect that interrupts the fiber executing it.
    pub fn interrupt() -> Self {
        Self::from_instruction(Instruction::Descriptor(Box::new(|descriptor| {
            Instruction::Fail(Cause::interrupt(descriptor.id))
        })))
    }

    /// Returns an effect that fails as if interrupted by `by`.
    pub fn interrupt_as(by: FiberId) -> Self {
        Self::from_instruction(Instruction::Fail(Cause::interrupt(by)))
    }

    /// Returns an effect built from the interrupt status of the region it
    /// executes in.
    pub fn check_interruptible(
        effect: impl FnOnce(InterruptStatus) -> Self + Send + 'static,
    ) -> Self {
        Self::from_instruction(Instruction::CheckInterrupt(Box::new(move |status| {
            effect(status).instruction
        })))
    }

    /// Returns an effect built from a snapshot of the executing fiber.
    pub fn descriptor_with(effect: impl FnOnce(Descriptor) -> Self + Send + 'static) -> Self {
        Self::from_instruction(Instruction::Descriptor(Box::new(move |descriptor| {
            effect(descriptor).instruction
        })))
    }

    /// Returns an effect that reads the environment of type `R` provided by
    /// an enclosing [`provide`](Self::provide).
    ///
    /// The effect dies if no environment of type `R` is in scope.
    pub fn access<R>(read: impl FnOnce(&R) -> A + Send + 'static) -> Self
    where
        R: 'static,
    {
        Self::access_effect(move |environment: &R| Self::succeed(read(environment)))
    }

    /// Returns an effect built from the environment of type `R` provided by
    /// an enclosing [`provide`](Self::provide).
    pub fn access_effect<R>(effect: impl FnOnce(&R) -> Self + Send + 'static) -> Self
    where
        R: 'static,
    {
        Self::from_instruction(Instruction::Access(Box::new(move |environment| {
            let provided = environment
                .as_ref()
                .and_then(|environment| environment.downcast_ref::<R>());
            match provided {
                Some(environment) => effect(environment).instruction,
                None => Instruction::die(format!(
                    "no {} environment provided",
                    std::any::type_name::<R>()
                )),
            }
        })))
    }

    /// Returns an effect that produces a clone of the environment provided
    /// by an enclosing [`provide`](Self::provide).
    pub fn environment() -> Self
    where
        A: Clone,
    {
        Self::access(A::clone)
    }

    /// Returns an effect that transforms this effect's value with `map`.
    pub fn map<B>(self, map: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        Effect::from_instruction(self.instruction.flat_map(Box::new(move |value| {
            Instruction::succeed(map(downcast::<A>(value)))
        })))
    }

    /// Returns an effect that continues with the effect `next` builds from
    /// this effect's value.
    pub fn flat_map<B>(self, next: impl FnOnce(A) -> Effect<B, E> + Send + 'static) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        Effect::from_instruction(self.instruction.flat_map(Box::new(move |value| {
            next(downcast::<A>(value)).instruction
        })))
    }

    /// Returns an effect that replaces this effect's value with `value`.
    pub fn as_value<B>(self, value: B) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        self.map(move |_| value)
    }

    /// Returns an effect that discards this effect's value.
    pub fn discard(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Returns an effect that runs `that` after this effect and combines
    /// both values with `combine`.
    pub fn zip_with<B, C>(
        self,
        that: Effect<B, E>,
        combine: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        self.flat_map(move |a| that.map(move |b| combine(a, b)))
    }

    /// Returns an effect that runs `that` after this effect and produces
    /// both values.
    pub fn zip<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Send + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Returns an effect that runs `that` after this effect and produces
    /// the value of `that`.
    pub fn zip_right<B>(self, that: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| that)
    }

    /// Returns an effect that runs `that` after this effect and produces
    /// this effect's value.
    pub fn zip_left<B>(self, that: Effect<B, E>) -> Self
    where
        B: Send + 'static,
    {
        self.flat_map(move |value| that.as_value(value))
    }

    /// Returns an effect that transforms every typed failure with
    /// `map`.
    pub fn map_err<E2>(self, map: impl FnMut(E) -> E2 + Send + 'static) -> Effect<A, E2>
    where
        E2: Send + 'static,
    {
        self.catch_all_cause(move |cause| Effect::fail_cause(cause.map(map)))
    }

    /// Returns an effect that continues with `failure` if this effect fails
    /// for any reason, or with `success` if it succeeds.
    pub fn fold_cause_effect<B, E2>(
        self,
        failure: impl FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        Effect::from_instruction(Instruction::Fold {
            effect: Box::new(self.instruction),
            failure: Box::new(move |cause| failure(cause.map(downcast::<E>)).instruction),
            success: Box::new(move |value| success(downcast::<A>(value)).instruction),
        })
    }

    /// Returns an effect that produces the result of `failure` if this
    /// effect fails for any reason, or of `success` if it succeeds.
    pub fn fold_cause<B, E2>(
        self,
        failure: impl FnOnce(Cause<E>) -> B + Send + 'static,
        success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| Effect::succeed(failure(cause)),
            move |value| Effect::succeed(success(value)),
        )
    }

    /// Returns an effect that continues with `failure` if this effect fails
    /// with a typed error, or with `success` if it succeeds. Defects and
    /// interruptions propagate unchanged.
    pub fn fold_effect<B, E2>(
        self,
        failure: impl FnOnce(E) -> Effect<B, E2> + Send + 'static,
        success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => failure(error),
                Err(cause) => Effect::fail_cause(retype(cause)),
            },
            success,
        )
    }

    /// Returns an effect that produces the result of `failure` if this
    /// effect fails with a typed error, or of `success` if it succeeds.
    pub fn fold<B, E2>(
        self,
        failure: impl FnOnce(E) -> B + Send + 'static,
        success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        self.fold_effect(
            move |error| Effect::succeed(failure(error)),
            move |value| Effect::succeed(success(value)),
        )
    }

    /// Returns an effect that recovers from any failure with `handler`.
    pub fn catch_all_cause<E2>(
        self,
        handler: impl FnOnce(Cause<E>) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2>
    where
        E2: Send + 'static,
    {
        Effect::from_instruction(Instruction::CatchCause {
            effect: Box::new(self.instruction),
            failure: Box::new(move |cause| handler(cause.map(downcast::<E>)).instruction),
        })
    }

    /// Returns an effect that recovers from typed failures with `handler`.
    /// Defects and interruptions propagate unchanged.
    pub fn catch_all<E2>(
        self,
        handler: impl FnOnce(E) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2>
    where
        E2: Send + 'static,
    {
        self.catch_all_cause(move |cause| match cause.failure_or_cause() {
            Ok(error) => handler(error),
            Err(cause) => Effect::fail_cause(retype(cause)),
        })
    }

    /// Returns an effect that always succeeds with the [`Exit`] of this
    /// effect.
    pub fn exit<E2>(self) -> Effect<Exit<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fold_cause(Exit::Failure, Exit::Success)
    }

    /// Returns an effect that succeeds with `Ok` when this effect succeeds
    /// and with `Err` when it fails with a typed error.
    pub fn result<E2>(self) -> Effect<Result<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fold(Err, Ok)
    }

    /// Returns an effect that runs this effect with `environment` available
    /// to [`access`](Self::access).
    pub fn provide<R>(self, environment: R) -> Self
    where
        R: Send + Sync + 'static,
    {
        Self::from_instruction(Instruction::Provide {
            environment: Arc::new(environment),
            effect: Box::new(self.instruction),
        })
    }

    /// Returns an effect that can be interrupted while it executes.
    pub fn interruptible(self) -> Self {
        Self::from_instruction(
            self.instruction
                .with_interrupt_status(InterruptStatus::Interruptible),
        )
    }

    /// Returns an effect that defers interruption until it exits.
    pub fn uninterruptible(self) -> Self {
        Self::from_instruction(
            self.instruction
                .with_interrupt_status(InterruptStatus::Uninterruptible),
        )
    }

    /// Returns an effect that records its instructions in the fiber's
    /// [`Trace`].
    pub fn traced(self) -> Self {
        self.with_tracing(true)
    }

    /// Returns an effect that doesn't record its instructions in the fiber's
    /// [`Trace`].
    pub fn untraced(self) -> Self {
        self.with_tracing(false)
    }

    fn with_tracing(self, enabled: bool) -> Self {
        Self::from_instruction(Instruction::SetTracing {
            enabled,
            effect: Box::new(self.instruction),
        })
    }

    /// Returns an effect whose forked fibers are reported to `supervisor`.
    pub fn supervised(self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.with_supervisor(Some(supervisor))
    }

    /// Returns an effect whose forked fibers aren't reported to any
    /// supervisor.
    pub fn unsupervised(self) -> Self {
        self.with_supervisor(None)
    }

    fn with_supervisor(self, supervisor: Option<Arc<dyn Supervisor>>) -> Self {
        Self::from_instruction(Instruction::Supervise {
            supervisor,
            effect: Box::new(self.instruction),
        })
    }

    /// Returns an effect whose forked fibers are registered in `scope`
    /// instead of the executing fiber's scope.
    pub fn in_fork_scope(self, scope: Scope) -> Self {
        Self::from_instruction(Instruction::OverrideForkScope {
            scope,
            effect: Box::new(self.instruction),
        })
    }

    pub(crate) fn into_shared_instruction(self) -> Instruction
    where
        A: Sync,
        E: Sync,
    {
        Instruction::Fold {
            effect: Box::new(self.instruction),
            failure: Box::new(|cause| {
                Instruction::Fail(cause.map(|error| Box::new(share::<E>(error)) as AnyValue))
            }),
            success: Box::new(|value| Instruction::succeed(share::<A>(value))),
        }
    }
}

impl<E> Effect<(), E>
where
    E: Send + 'static,
{
    /// Returns an effect that produces `()`.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Returns an effect that reschedules the executing fiber, letting other
    /// fibers run.
    pub fn yield_now() -> Self {
        Self::from_instruction(Instruction::Yield)
    }

    /// Returns an effect that completes after `duration` has elapsed.
    ///
    /// The fiber is suspended while waiting and can be interrupted.
    pub fn sleep(duration: Duration) -> Self {
        Self::async_effect(move |callback| {
            let deadline = Instant::now() + duration;
            let scheduler = callback.scheduler().clone();
            scheduler.dispatch_at(
                deadline,
                Box::new(move || {
                    callback.succeed(());
                }),
            );
        })
    }
}

impl<E> Effect<FiberId, E>
where
    E: Send + 'static,
{
    /// Returns an effect that produces the id of the executing fiber.
    pub fn fiber_id() -> Self {
        Self::descriptor_with(|descriptor| Self::succeed(descriptor.id))
    }
}

impl<E> Effect<Descriptor, E>
where
    E: Send + 'static,
{
    /// Returns an effect that produces a snapshot of the executing fiber.
    pub fn descriptor() -> Self {
        Self::descriptor_with(Self::succeed)
    }
}

impl<E> Effect<Trace, E>
where
    E: Send + 'static,
{
    /// Returns an effect that produces the executing fiber's recent
    /// instructions.
    pub fn trace() -> Self {
        Self::from_instruction(Instruction::Trace(Box::new(Instruction::succeed::<Trace>)))
    }
}

impl<E> Effect<Scope, E>
where
    E: Send + 'static,
{
    /// Returns an effect that produces the scope fibers forked by the
    /// executing fiber are registered in.
    pub fn fork_scope() -> Self {
        Self::from_instruction(Instruction::GetForkScope(Box::new(
            Instruction::succeed::<Scope>,
        )))
    }
}

impl<A, E> Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("instruction", &self.instruction.tag())
            .finish()
    }
}

/// Converts a cause without typed failures into another error type.
fn retype<E, E2>(cause: Cause<E>) -> Cause<E2> {
    cause.try_map(&mut |_| Err(Defect::new("typed failure escaped its handler")))
}
