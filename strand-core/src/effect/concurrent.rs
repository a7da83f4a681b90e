use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Effect, Output};
use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber::{typed_exit, Fiber, RuntimeFiber};
use crate::instruction::{Instruction, RaceWith, Shared};
use crate::platform::ReportFailure;
use crate::scope::Scope;

impl<A, E> Effect<A, E>
where
    A: Output,
    E: Output,
{
    /// Returns an effect that starts this effect on a new fiber and produces
    /// a handle to it without waiting.
    ///
    /// The fiber is registered in the executing fiber's scope, so it is
    /// interrupted if still running when the executing fiber exits.
    pub fn fork<E2>(self) -> Effect<Fiber<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fork_with(None, None)
    }

    /// Returns an effect that starts this effect on a new fiber in the
    /// global scope. The fiber may outlive the fiber that forked it.
    pub fn fork_daemon<E2>(self) -> Effect<Fiber<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fork_with(Some(Scope::global()), None)
    }

    /// Returns an effect that starts this effect on a new fiber registered
    /// in `scope`.
    pub fn fork_in<E2>(self, scope: Scope) -> Effect<Fiber<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fork_with(Some(scope), None)
    }

    /// Returns an effect that starts this effect on a new fiber that reports
    /// unhandled failures to `report` instead of the runtime's reporter.
    pub fn fork_with_reporter<E2>(
        self,
        report: impl Fn(&Cause<Shared>) + Send + Sync + 'static,
    ) -> Effect<Fiber<A, E>, E2>
    where
        E2: Send + 'static,
    {
        self.fork_with(None, Some(Arc::new(report)))
    }

    fn fork_with<E2>(
        self,
        scope: Option<Scope>,
        report_failure: Option<ReportFailure>,
    ) -> Effect<Fiber<A, E>, E2>
    where
        E2: Send + 'static,
    {
        Effect::<RuntimeFiber, E2>::from_instruction(Instruction::Fork {
            effect: Box::new(self.into_shared_instruction()),
            scope,
            report_failure,
        })
        .map(Fiber::new)
    }

    /// Returns an effect that runs this effect and `that` concurrently and
    /// continues with the continuation of whichever exits first.
    ///
    /// The continuation receives the winner's exit and the loser's fiber,
    /// which keeps running. When the winner succeeded, its fiber-local
    /// values are joined into the executing fiber's values before the
    /// continuation runs.
    pub fn race_with<B, E2, C, E3>(
        self,
        that: Effect<B, E2>,
        left_wins: impl FnOnce(Exit<A, E>, Fiber<B, E2>) -> Effect<C, E3> + Send + 'static,
        right_wins: impl FnOnce(Exit<B, E2>, Fiber<A, E>) -> Effect<C, E3> + Send + 'static,
    ) -> Effect<C, E3>
    where
        B: Output,
        E2: Output,
        C: Send + 'static,
        E3: Send + 'static,
    {
        Effect::from_instruction(Instruction::RaceWith(Box::new(RaceWith {
            left: self.into_shared_instruction(),
            right: that.into_shared_instruction(),
            left_wins: Box::new(move |exit, loser| {
                left_wins(typed_exit(exit), Fiber::new(loser)).into_instruction()
            }),
            right_wins: Box::new(move |exit, loser| {
                right_wins(typed_exit(exit), Fiber::new(loser)).into_instruction()
            }),
            scope: None,
        })))
    }

    /// Returns an effect that races this effect against `that`.
    ///
    /// See [`race_all`](Self::race_all).
    pub fn race(self, that: Self) -> Self {
        Self::race_all(vec![self, that])
    }

    /// Returns an effect that runs every effect concurrently and finishes
    /// with the first one that succeeds or fails with something other than
    /// an interruption.
    ///
    /// Competitors that exit only because they were interrupted are
    /// skipped, unless every competitor does. Once the race is decided, the
    /// remaining competitors are interrupted and awaited. A winner that
    /// succeeded has its fiber-local values joined into the executing
    /// fiber's values.
    pub fn race_all(effects: impl IntoIterator<Item = Self>) -> Self {
        Self::race_many(effects.into_iter().collect(), |exit| match exit {
            Exit::Success(_) => true,
            Exit::Failure(cause) => !cause.interrupted_only(),
        })
    }

    /// Returns an effect that runs every effect concurrently and finishes
    /// with whichever exits first, successfully or not. The remaining
    /// competitors are interrupted and awaited.
    pub fn race_all_first(effects: impl IntoIterator<Item = Self>) -> Self {
        Self::race_many(effects.into_iter().collect(), |_| true)
    }

    fn race_many(effects: Vec<Self>, decides: fn(&Exit<A, E>) -> bool) -> Self {
        if effects.is_empty() {
            return Self::die("raced no effects");
        }
        Self::uninterruptible_mask(move |restore| {
            let forked = effects.into_iter().fold(
                Effect::<Vec<Fiber<A, E>>, E>::succeed(Vec::new()),
                |forked, effect| {
                    forked.flat_map(move |mut fibers| {
                        effect.interruptible().fork().map(move |fiber| {
                            fibers.push(fiber);
                            fibers
                        })
                    })
                },
            );
            forked.flat_map(move |fibers| {
                let observed = fibers.clone();
                restore
                    .apply(Effect::<(Exit<A, E>, Fiber<A, E>), E>::async_effect(
                        move |callback| {
                            let remaining = Arc::new(AtomicUsize::new(observed.len()));
                            let decided = Arc::new(AtomicBool::new(false));
                            for fiber in observed {
                                let remaining = remaining.clone();
                                let decided = decided.clone();
                                let callback = callback.clone();
                                let winner = fiber.clone();
                                fiber.on_done(move |exit| {
                                    let last = remaining.fetch_sub(1, Ordering::AcqRel) == 1;
                                    if (last || decides(&exit))
                                        && decided
                                            .compare_exchange(
                                                false,
                                                true,
                                                Ordering::AcqRel,
                                                Ordering::Acquire,
                                            )
                                            .is_ok()
                                    {
                                        callback.succeed((exit, winner));
                                    }
                                });
                            }
                        },
                    ))
                    .exit()
                    .flat_map(move |waited| {
                        interrupt_all(fibers).zip_right(match waited {
                            Exit::Success((Exit::Success(value), winner)) => {
                                winner.inherit_refs().as_value(value)
                            }
                            Exit::Success((exit, _)) => Effect::done(exit),
                            Exit::Failure(cause) => Effect::fail_cause(cause),
                        })
                    })
            })
        })
    }

    /// Returns an effect that runs this effect and `that` concurrently and
    /// produces both values.
    ///
    /// If either side fails, the other is interrupted and the failure is
    /// propagated.
    pub fn zip_par<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Output,
    {
        self.race_with(
            that,
            |exit, right| match exit {
                Exit::Success(a) => right.join().map(move |b| (a, b)),
                Exit::Failure(cause) => right.interrupt().zip_right(Effect::fail_cause(cause)),
            },
            |exit, left| match exit {
                Exit::Success(b) => left.join().map(move |a| (a, b)),
                Exit::Failure(cause) => left.interrupt().zip_right(Effect::fail_cause(cause)),
            },
        )
    }

    /// Returns an effect that runs this effect and `that` concurrently and
    /// combines both values with `combine`.
    pub fn zip_with_par<B, C>(
        self,
        that: Effect<B, E>,
        combine: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E>
    where
        B: Output,
        C: Send + 'static,
    {
        self.zip_par(that).map(move |(a, b)| combine(a, b))
    }

    /// Returns an effect that produces `None` if this effect doesn't finish
    /// within `duration`. The effect is interrupted when it times out.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.race_with(
            Effect::<(), E>::sleep(duration),
            |exit, sleeper| sleeper.interrupt().zip_right(Effect::done(exit).map(Some)),
            |_, fiber| fiber.interrupt().as_value(None),
        )
    }
}

fn interrupt_all<A, E>(fibers: Vec<Fiber<A, E>>) -> Effect<(), E>
where
    A: Output,
    E: Output,
{
    fibers
        .into_iter()
        .fold(Effect::unit(), |interrupted, fiber| {
            interrupted.zip_right(fiber.interrupt().discard())
        })
}
