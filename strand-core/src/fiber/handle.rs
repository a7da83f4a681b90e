use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use super::state::Canceller;
use super::{FiberContext, Status};
use crate::cause::Defect;
use crate::effect::{Effect, Output};
use crate::exit::Exit;
use crate::id::FiberId;
use crate::instruction::{ErasedExit, Instruction};
use crate::scheduler::Scheduler;

/// A handle to a fiber whose value and error types have been erased.
#[derive(Clone)]
pub struct RuntimeFiber(Arc<FiberContext>);

impl RuntimeFiber {
    pub(crate) const fn new(context: Arc<FiberContext>) -> Self {
        Self(context)
    }

    /// Returns the id of this fiber.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.0.id()
    }

    /// Returns the current status of this fiber.
    #[must_use]
    pub fn status(&self) -> Status {
        self.0.status()
    }

    /// Returns this fiber's exit if it has exited, without waiting.
    #[must_use]
    pub fn poll(&self) -> Option<ErasedExit> {
        self.0.poll()
    }

    /// Returns true if this fiber has exited.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.poll().is_some()
    }

    /// Invokes `observer` with this fiber's exit once it exits.
    ///
    /// The observer runs on the thread that completes the fiber, or on the
    /// calling thread if the fiber has already exited.
    pub fn on_done(&self, observer: impl FnOnce(ErasedExit) + Send + 'static) {
        self.0.on_done(Box::new(observer));
    }

    /// Returns an effect that waits for this fiber to exit.
    #[must_use]
    pub fn await_exit<E>(&self) -> Effect<ErasedExit, E>
    where
        E: Send + 'static,
    {
        Effect::from_instruction(self.0.await_exit())
    }

    /// Returns an effect that interrupts this fiber on behalf of the fiber
    /// executing the effect, and waits for it to exit.
    #[must_use]
    pub fn interrupt<E>(&self) -> Effect<ErasedExit, E>
    where
        E: Send + 'static,
    {
        let fiber = self.clone();
        Effect::fiber_id().flat_map(move |by| fiber.interrupt_as(by))
    }

    /// Returns an effect that interrupts this fiber on behalf of `by`, and
    /// waits for it to exit.
    #[must_use]
    pub fn interrupt_as<E>(&self, by: FiberId) -> Effect<ErasedExit, E>
    where
        E: Send + 'static,
    {
        Effect::from_instruction(self.0.interrupt_as(by))
    }

    /// Returns an effect that joins this fiber's fiber-local values, as they
    /// were when it exited, into the values of the fiber executing the
    /// effect. The effect dies if this fiber hasn't exited yet.
    #[must_use]
    pub fn inherit_refs<E>(&self) -> Effect<(), E>
    where
        E: Send + 'static,
    {
        Effect::from_instruction(self.0.inherit_refs())
    }

    /// Requests that this fiber be interrupted without waiting for it to
    /// exit. The interruption is attributed to [`FiberId::NONE`].
    pub fn cancel(&self) {
        self.0.kill(FiberId::NONE);
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<FiberContext> {
        &self.0
    }
}

impl Debug for RuntimeFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFiber")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// A handle to a fiber that produces `A` or fails with `E`.
pub struct Fiber<A, E> {
    fiber: RuntimeFiber,
    _types: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Fiber<A, E>
where
    A: Output,
    E: Output,
{
    pub(crate) const fn new(fiber: RuntimeFiber) -> Self {
        Self {
            fiber,
            _types: PhantomData,
        }
    }

    /// Returns the id of this fiber.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Returns the current status of this fiber.
    #[must_use]
    pub fn status(&self) -> Status {
        self.fiber.status()
    }

    /// Returns the type-erased handle of this fiber.
    #[must_use]
    pub const fn runtime_fiber(&self) -> &RuntimeFiber {
        &self.fiber
    }

    /// Returns this fiber's exit if it has exited, without waiting.
    #[must_use]
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.fiber.poll().map(typed_exit)
    }

    /// Invokes `observer` with this fiber's exit once it exits.
    pub fn on_done(&self, observer: impl FnOnce(Exit<A, E>) + Send + 'static) {
        self.fiber.on_done(move |exit| observer(typed_exit(exit)));
    }

    /// Returns an effect that waits for this fiber to exit.
    #[must_use]
    pub fn await_exit<E2>(&self) -> Effect<Exit<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fiber.await_exit().map(typed_exit)
    }

    /// Returns an effect that waits for this fiber to exit and then
    /// continues with its result.
    ///
    /// When the fiber succeeded, its fiber-local values are joined into the
    /// values of the fiber executing the effect.
    #[must_use]
    pub fn join(&self) -> Effect<A, E> {
        let fiber = self.fiber.clone();
        self.await_exit().flat_map(move |exit| match exit {
            Exit::Success(value) => fiber.inherit_refs().map(move |()| value),
            Exit::Failure(cause) => Effect::fail_cause(cause),
        })
    }

    /// Returns an effect that interrupts this fiber on behalf of the fiber
    /// executing the effect, and waits for it to exit.
    #[must_use]
    pub fn interrupt<E2>(&self) -> Effect<Exit<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fiber.interrupt().map(typed_exit)
    }

    /// Returns an effect that interrupts this fiber on behalf of `by`, and
    /// waits for it to exit.
    #[must_use]
    pub fn interrupt_as<E2>(&self, by: FiberId) -> Effect<Exit<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fiber.interrupt_as(by).map(typed_exit)
    }

    /// Returns an effect that joins this fiber's fiber-local values, as they
    /// were when it exited, into the values of the fiber executing the
    /// effect. The effect dies if this fiber hasn't exited yet.
    #[must_use]
    pub fn inherit_refs<E2>(&self) -> Effect<(), E2>
    where
        E2: Send + 'static,
    {
        self.fiber.inherit_refs()
    }

    /// Requests that this fiber be interrupted without waiting for it to
    /// exit.
    pub fn cancel(&self) {
        self.fiber.cancel();
    }
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            _types: PhantomData,
        }
    }
}

impl<A, E> Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.fiber, f)
    }
}

/// Recovers the typed exit of a fiber from its shared exit.
pub(crate) fn typed_exit<A, E>(exit: ErasedExit) -> Exit<A, E>
where
    A: Output,
    E: Output,
{
    match exit {
        Exit::Success(value) => match value.downcast_ref::<A>() {
            Some(value) => Exit::Success(value.clone()),
            None => Exit::die(format!(
                "fiber did not produce a {}",
                std::any::type_name::<A>()
            )),
        },
        Exit::Failure(cause) => Exit::Failure(cause.try_map(&mut |error| {
            error.downcast_ref::<E>().cloned().ok_or_else(|| {
                Defect::new(format!(
                    "fiber did not fail with a {}",
                    std::any::type_name::<E>()
                ))
            })
        })),
    }
}

/// Resumes a fiber suspended at a specific asynchronous epoch.
#[derive(Clone)]
pub(crate) struct Resume {
    fiber: Arc<FiberContext>,
    epoch: u64,
}

impl Resume {
    pub const fn new(fiber: Arc<FiberContext>, epoch: u64) -> Self {
        Self { fiber, epoch }
    }

    /// Continues the fiber with `instruction`. Returns false if the fiber
    /// has already left this suspension, in which case nothing happens.
    pub fn resume(&self, instruction: Instruction) -> bool {
        if self.fiber.exit_async(self.epoch) {
            self.fiber.evaluate_later(instruction);
            true
        } else {
            false
        }
    }

    /// Runs `cancel` if the fiber is woken from this suspension by an
    /// interruption. Runs it right away if the fiber already left the
    /// suspension.
    pub fn on_interrupt(&self, cancel: Canceller) {
        if let Some(cancel) = self.fiber.set_canceller(self.epoch, cancel) {
            cancel();
        }
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        self.fiber.platform().scheduler()
    }
}

/// Completes an asynchronous effect.
///
/// A callback only completes the suspension it was created for. Completing
/// it more than once, or after the suspended fiber was interrupted, has no
/// effect.
pub struct Callback<A, E> {
    resume: Resume,
    _types: PhantomData<fn(A, E)>,
}

impl<A, E> Callback<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub(crate) const fn new(resume: Resume) -> Self {
        Self {
            resume,
            _types: PhantomData,
        }
    }

    /// Resumes the fiber with `effect`. Returns true if the fiber was
    /// resumed.
    pub fn resume(&self, effect: Effect<A, E>) -> bool {
        self.resume.resume(effect.into_instruction())
    }

    /// Resumes the fiber with a successful value.
    pub fn succeed(&self, value: A) -> bool {
        self.resume(Effect::succeed(value))
    }

    /// Resumes the fiber with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.resume(Effect::fail(error))
    }

    /// Resumes the fiber with `exit`.
    pub fn done(&self, exit: Exit<A, E>) -> bool {
        self.resume(Effect::done(exit))
    }

    /// Returns the id of the suspended fiber.
    #[must_use]
    pub fn fiber_id(&self) -> FiberId {
        self.resume.fiber_id()
    }

    /// Returns the scheduler the suspended fiber runs on.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        self.resume.scheduler()
    }
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _types: PhantomData,
        }
    }
}
