use std::convert::Infallible;

use kempt::Map;
use serde::{Deserialize, Serialize};

use crate::cause::Cause;
use crate::fiber_ref::FiberRefs;
use crate::id::FiberId;
use crate::instruction::ErasedExit;

pub(crate) type Observer = Box<dyn FnOnce(ErasedExit) + Send>;

/// Undoes the registration made by an asynchronous suspension when the
/// suspended fiber is woken by an interruption.
pub(crate) type Canceller = Box<dyn FnOnce() + Send>;

/// The lifecycle state of a fiber.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Status {
    /// The fiber is executing instructions.
    Running {
        /// True while an interruption is being propagated.
        interrupting: bool,
    },
    /// The fiber is waiting for an asynchronous callback.
    Suspended {
        /// The status the fiber had before it suspended.
        previous: Box<Status>,
        /// Whether the fiber can be interrupted while suspended.
        interruptible: bool,
        /// The asynchronous epoch the fiber is waiting on.
        epoch: u64,
        /// Fibers the suspended fiber is waiting on, if known.
        blocking_on: Vec<FiberId>,
    },
    /// The fiber produced its exit and is closing its scope.
    Finishing {
        /// True while an interruption is being propagated.
        interrupting: bool,
    },
    /// The fiber has exited.
    Done,
}

impl Status {
    /// Returns true if an interruption is being propagated.
    #[must_use]
    pub fn is_interrupting(&self) -> bool {
        match self {
            Status::Running { interrupting } | Status::Finishing { interrupting } => *interrupting,
            Status::Suspended { previous, .. } => previous.is_interrupting(),
            Status::Done => false,
        }
    }

    /// Returns true if the fiber has exited.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Status::Done)
    }

    pub(crate) fn with_interrupting(self, interrupting: bool) -> Self {
        match self {
            Status::Running { .. } => Status::Running { interrupting },
            Status::Finishing { .. } => Status::Finishing { interrupting },
            Status::Suspended {
                previous,
                interruptible,
                epoch,
                blocking_on,
            } => Status::Suspended {
                previous: Box::new(previous.with_interrupting(interrupting)),
                interruptible,
                epoch,
                blocking_on,
            },
            Status::Done => Status::Done,
        }
    }
}

pub(crate) enum FiberState {
    Executing {
        status: Status,
        observers: Map<u64, Observer>,
        next_observer: u64,
        canceller: Option<Canceller>,
        interrupted: Cause<Infallible>,
    },
    Done {
        exit: ErasedExit,
        /// The fiber's fiber-local values when it exited.
        refs: FiberRefs,
    },
}

impl FiberState {
    pub fn new() -> Self {
        Self::Executing {
            status: Status::Running {
                interrupting: false,
            },
            observers: Map::new(),
            next_observer: 0,
            canceller: None,
            interrupted: Cause::Empty,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            FiberState::Executing { status, .. } => status.clone(),
            FiberState::Done { .. } => Status::Done,
        }
    }

    pub fn interrupted(&self) -> Cause<Infallible> {
        match self {
            FiberState::Executing { interrupted, .. } => interrupted.clone(),
            FiberState::Done { .. } => Cause::Empty,
        }
    }
}
