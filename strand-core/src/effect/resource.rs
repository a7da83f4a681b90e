use std::convert::Infallible;

use super::Effect;
use crate::exit::Exit;
use crate::instruction::{Instruction, InterruptStatus};

/// Restores the interrupt status that was active outside of an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Restore(InterruptStatus);

impl Restore {
    /// Returns `effect` running with the restored interrupt status.
    pub fn apply<A, E>(self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_instruction(effect.into_instruction().with_interrupt_status(self.0))
    }

    /// Returns the interrupt status this restores.
    #[must_use]
    pub const fn status(self) -> InterruptStatus {
        self.0
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Returns an uninterruptible effect built by `effect`, which receives a
    /// [`Restore`] that makes parts of it interruptible again if the
    /// surrounding region was interruptible.
    pub fn uninterruptible_mask(effect: impl FnOnce(Restore) -> Self + Send + 'static) -> Self {
        Self::from_instruction(Instruction::CheckInterrupt(Box::new(move |status| {
            effect(Restore(status))
                .into_instruction()
                .with_interrupt_status(InterruptStatus::Uninterruptible)
        })))
    }

    /// Returns an effect that runs `cleanup` after this effect exits for
    /// any reason, including interruption.
    ///
    /// `cleanup` runs uninterruptibly. If it fails, its cause is appended to
    /// the cause of this effect.
    pub fn on_exit(
        self,
        cleanup: impl FnOnce(&Exit<A, E>) -> Effect<(), Infallible> + Send + 'static,
    ) -> Self {
        Self::uninterruptible_mask(move |restore| {
            restore.apply(self).exit().flat_map(move |exit| {
                cleanup(&exit)
                    .exit()
                    .flat_map(move |cleaned_up| match (exit, cleaned_up) {
                        (exit, Exit::Success(())) => Effect::done(exit),
                        (Exit::Success(_), Exit::Failure(cause)) => {
                            Effect::fail_cause(cause.lift())
                        }
                        (Exit::Failure(original), Exit::Failure(cause)) => {
                            Effect::fail_cause(original.then(cause.lift()))
                        }
                    })
            })
        })
    }

    /// Returns an effect that runs `finalizer` after this effect exits for
    /// any reason, including interruption.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        self.on_exit(move |_| finalizer)
    }

    /// Returns an effect that acquires a resource, uses it and releases it.
    ///
    /// `acquire` and `release` are uninterruptible. Once `acquire`
    /// succeeds, `release` runs exactly once no matter how `usage` exits.
    pub fn acquire_release<R>(
        acquire: Effect<R, E>,
        usage: impl FnOnce(R) -> Self + Send + 'static,
        release: impl FnOnce(R, &Exit<A, E>) -> Effect<(), Infallible> + Send + 'static,
    ) -> Self
    where
        R: Clone + Send + 'static,
    {
        Self::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |resource| {
                let released = resource.clone();
                restore
                    .apply(Effect::suspend(move || usage(resource)))
                    .on_exit(move |exit| release(released, exit))
            })
        })
    }
}
