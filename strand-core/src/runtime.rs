//! Entry points for running effects.

use crate::effect::{Effect, Output};
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberContext, RuntimeFiber};
use crate::id::FiberId;
use crate::platform::Platform;

/// Runs effects on root fibers.
#[derive(Clone)]
pub struct Runtime {
    platform: Platform,
}

impl Runtime {
    /// Returns a runtime that executes fibers on `platform`.
    #[must_use]
    pub const fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Returns the platform fibers of this runtime execute on.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Starts `effect` on a new root fiber and returns its handle without
    /// waiting.
    pub fn spawn<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Output,
        E: Output,
    {
        let fiber = FiberContext::root(self.platform.clone());
        debug!(fiber = %fiber.id(), "spawning root fiber");
        fiber.evaluate_later(effect.into_shared_instruction());
        Fiber::new(RuntimeFiber::new(fiber))
    }

    /// Starts `effect` on a new root fiber and invokes `callback` with its
    /// exit once it exits.
    pub fn run<A, E>(
        &self,
        effect: Effect<A, E>,
        callback: impl FnOnce(Exit<A, E>) + Send + 'static,
    ) -> Fiber<A, E>
    where
        A: Output,
        E: Output,
    {
        let fiber = self.spawn(effect);
        fiber.on_done(callback);
        fiber
    }

    /// Returns the fibers forked into the global scope that are still
    /// running.
    ///
    /// Daemon fibers are only tracked when
    /// [`RuntimeConfig::track_daemons`](crate::platform::RuntimeConfig::track_daemons)
    /// is enabled. Otherwise this returns an empty list.
    #[must_use]
    pub fn live_daemons(&self) -> Vec<RuntimeFiber> {
        self.platform
            .daemons()
            .map(|daemons| daemons.live())
            .unwrap_or_default()
    }

    /// Returns an effect that interrupts every tracked daemon fiber and
    /// waits for them to exit.
    pub fn interrupt_daemons<E>(&self) -> Effect<(), E>
    where
        E: Send + 'static,
    {
        let daemons = self.live_daemons();
        Effect::suspend(move || {
            daemons
                .into_iter()
                .fold(Effect::unit(), |interrupted, daemon| {
                    interrupted.zip_right(daemon.interrupt_as(FiberId::NONE).discard())
                })
        })
    }
}
