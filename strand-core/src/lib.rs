//! A cooperative fiber runtime.
//!
//! Programs are described as [`Effect`](effect::Effect) values and executed
//! by fibers: lightweight threads of execution that are multiplexed over a
//! [`Scheduler`](scheduler::Scheduler). Fibers can be forked, joined, raced
//! and interrupted. Every fiber runs inside a [`Scope`](scope::Scope) that
//! interrupts the fibers forked into it when the scope closes.

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod cause;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub mod id;
pub mod platform;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod supervisor;

mod instruction;
mod stack;

#[cfg(test)]
mod tests;

pub use cause::{Cause, Defect};
pub use effect::{Effect, Output, Restore};
pub use exit::Exit;
pub use fiber::{Callback, Descriptor, Fiber, RuntimeFiber, Status, Trace};
pub use fiber_ref::FiberRef;
pub use id::FiberId;
pub use instruction::{ErasedExit, InterruptStatus, Shared};
pub use platform::{Platform, RuntimeConfig};
pub use runtime::Runtime;
pub use scheduler::{CurrentThread, Scheduler};
pub use scope::Scope;
pub use supervisor::{Supervisor, Tracker};
