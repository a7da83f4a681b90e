//! The instruction set interpreted by fibers.
//!
//! Values flow through the interpreter type-erased. The typed [`Effect`]
//! surface guarantees that every continuation receives the type it expects.
//!
//! [`Effect`]: crate::effect::Effect

use std::any::Any;
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::exit::Exit;
use crate::fiber::{Descriptor, Resume, RuntimeFiber, Trace};
use crate::fiber_ref::FiberRefs;
use crate::id::FiberId;
use crate::platform::ReportFailure;
use crate::scope::Scope;
use crate::supervisor::Supervisor;

pub(crate) type AnyValue = Box<dyn Any + Send>;

/// A type-erased value that can be observed by more than one fiber.
pub type Shared = Arc<dyn Any + Send + Sync>;

/// The exit of a fiber whose value and error types have been erased.
pub type ErasedExit = Exit<Shared, Shared>;

pub(crate) type ErasedCause = Cause<AnyValue>;
pub(crate) type Continuation = Box<dyn FnOnce(AnyValue) -> Instruction + Send>;
pub(crate) type FailureHandler = Box<dyn FnOnce(ErasedCause) -> Instruction + Send>;
pub(crate) type Register = Box<dyn FnOnce(Resume) -> Option<Instruction> + Send>;
pub(crate) type RaceContinuation = Box<dyn FnOnce(ErasedExit, RuntimeFiber) -> Instruction + Send>;

/// Whether a region of a fiber can be interrupted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum InterruptStatus {
    /// Interruption is applied as soon as it is requested.
    Interruptible,
    /// Interruption is deferred until the region exits.
    Uninterruptible,
}

impl InterruptStatus {
    /// Returns true if this is [`InterruptStatus::Interruptible`].
    #[must_use]
    pub const fn is_interruptible(self) -> bool {
        matches!(self, Self::Interruptible)
    }
}

pub(crate) enum Instruction {
    Succeed(AnyValue),
    Sync(Box<dyn FnOnce() -> AnyValue + Send>),
    Partial(Box<dyn FnOnce() -> Result<AnyValue, AnyValue> + Send>),
    Fail(ErasedCause),
    Suspend(Box<dyn FnOnce() -> Instruction + Send>),
    FlatMap(Box<Instruction>, Continuation),
    Fold {
        effect: Box<Instruction>,
        failure: FailureHandler,
        success: Continuation,
    },
    CatchCause {
        effect: Box<Instruction>,
        failure: FailureHandler,
    },
    SetInterruptStatus {
        effect: Box<Instruction>,
        status: InterruptStatus,
    },
    CheckInterrupt(Box<dyn FnOnce(InterruptStatus) -> Instruction + Send>),
    Async {
        register: Register,
        blocking_on: Vec<FiberId>,
    },
    Fork {
        effect: Box<Instruction>,
        scope: Option<Scope>,
        report_failure: Option<ReportFailure>,
    },
    RaceWith(Box<RaceWith>),
    Descriptor(Box<dyn FnOnce(Descriptor) -> Instruction + Send>),
    Yield,
    Access(Box<dyn FnOnce(Option<Shared>) -> Instruction + Send>),
    Provide {
        environment: Shared,
        effect: Box<Instruction>,
    },
    SetTracing {
        enabled: bool,
        effect: Box<Instruction>,
    },
    Trace(Box<dyn FnOnce(Trace) -> Instruction + Send>),
    Supervise {
        supervisor: Option<Arc<dyn Supervisor>>,
        effect: Box<Instruction>,
    },
    GetForkScope(Box<dyn FnOnce(Scope) -> Instruction + Send>),
    OverrideForkScope {
        scope: Scope,
        effect: Box<Instruction>,
    },
    WithFiberRefs(Box<dyn FnOnce(&mut FiberRefs) -> Instruction + Send>),
}

pub(crate) struct RaceWith {
    pub left: Instruction,
    pub right: Instruction,
    pub left_wins: RaceContinuation,
    pub right_wins: RaceContinuation,
    pub scope: Option<Scope>,
}

impl Instruction {
    pub fn succeed<T>(value: T) -> Self
    where
        T: Send + 'static,
    {
        Self::Succeed(Box::new(value))
    }

    pub fn unit() -> Self {
        Self::succeed(())
    }

    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Fail(Cause::die(defect))
    }

    /// Replays an exit that has already been shared with observers.
    pub fn done(exit: ErasedExit) -> Self {
        match exit {
            Exit::Success(value) => Self::succeed(value),
            Exit::Failure(cause) => Self::Fail(cause.map(|error| Box::new(error) as AnyValue)),
        }
    }

    pub fn flat_map(self, continuation: Continuation) -> Self {
        Self::FlatMap(Box::new(self), continuation)
    }

    pub fn with_interrupt_status(self, status: InterruptStatus) -> Self {
        Self::SetInterruptStatus {
            effect: Box::new(self),
            status,
        }
    }

    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Succeed(_) => "succeed",
            Self::Sync(_) => "sync",
            Self::Partial(_) => "partial",
            Self::Fail(_) => "fail",
            Self::Suspend(_) => "suspend",
            Self::FlatMap(..) => "flat_map",
            Self::Fold { .. } => "fold",
            Self::CatchCause { .. } => "catch_cause",
            Self::SetInterruptStatus { .. } => "interrupt_status",
            Self::CheckInterrupt(_) => "check_interrupt",
            Self::Async { .. } => "async",
            Self::Fork { .. } => "fork",
            Self::RaceWith(_) => "race_with",
            Self::Descriptor(_) => "descriptor",
            Self::Yield => "yield",
            Self::Access(_) => "access",
            Self::Provide { .. } => "provide",
            Self::SetTracing { .. } => "tracing_status",
            Self::Trace(_) => "trace",
            Self::Supervise { .. } => "supervise",
            Self::GetForkScope(_) => "fork_scope",
            Self::OverrideForkScope { .. } => "override_fork_scope",
            Self::WithFiberRefs(_) => "fiber_refs",
        }
    }
}

/// A pending continuation on a fiber's stack.
pub(crate) enum Frame {
    /// Applied to the next successful value.
    Apply(Continuation),
    /// Applied to the next value or the next failure.
    Fold {
        failure: FailureHandler,
        success: Continuation,
    },
    /// Applied to the next failure; successful values pass through.
    Handler(FailureHandler),
    /// Pops the region stack that was pushed alongside this frame.
    Exit(RegionExit),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum RegionExit {
    Interrupt,
    Tracing,
    Environment,
    Supervisor,
    ForkScope,
}

pub(crate) fn downcast<T>(value: AnyValue) -> T
where
    T: 'static,
{
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => panic!("interpreter value was not a {}", std::any::type_name::<T>()),
    }
}

pub(crate) fn share<T>(value: AnyValue) -> Shared
where
    T: Send + Sync + 'static,
{
    Arc::new(downcast::<T>(value))
}

/// Converts the exit a fiber produced into the form shared with its
/// observers.
pub(crate) fn share_exit(exit: Exit<AnyValue, AnyValue>) -> ErasedExit {
    match exit {
        Exit::Success(value) => match value.downcast::<Shared>() {
            Ok(value) => Exit::Success(*value),
            Err(_) => Exit::die("fiber produced a value that can't be shared"),
        },
        Exit::Failure(cause) => Exit::Failure(cause.try_map(&mut |error: AnyValue| {
            error
                .downcast::<Shared>()
                .map(|error| *error)
                .map_err(|_| Defect::new("fiber failed with an error that can't be shared"))
        })),
    }
}
