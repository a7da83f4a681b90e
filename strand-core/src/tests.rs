use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;

use crate::cause::Cause;
use crate::effect::{Effect, Output};
use crate::exit::Exit;
use crate::fiber::{Callback, Descriptor, Fiber, Status, Trace};
use crate::fiber_ref::{FiberRef, FiberRefs};
use crate::id::FiberId;
use crate::instruction::{InterruptStatus, Shared};
use crate::platform::{Platform, RuntimeConfig};
use crate::runtime::Runtime;
use crate::scheduler::CurrentThread;
use crate::scope::Scope;
use crate::supervisor::Tracker;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn run<A, E>(effect: Effect<A, E>) -> Exit<A, E>
where
    A: Output,
    E: Output,
{
    CurrentThread::new().block_on(effect)
}

fn after(millis: u64, value: u32) -> Effect<u32, &'static str> {
    Effect::<(), &'static str>::sleep(Duration::from_millis(millis)).as_value(value)
}

#[test]
fn sequencing() {
    initialize_tracing();
    let program = Effect::<u32, Infallible>::succeed(20)
        .map(|value| value * 2)
        .zip_with(Effect::sync(|| 2), |a, b| a + b);
    assert_eq!(run(program), Exit::Success(42));
}

#[test]
fn typed_failures_are_caught() {
    let program = Effect::<u32, &'static str>::fail("missing")
        .map(|value| value + 1)
        .catch_all(|error| {
            Effect::<u32, Infallible>::succeed(u32::try_from(error.len()).unwrap_or(0))
        });
    assert_eq!(run(program), Exit::Success(7));

    let attempted =
        Effect::<u32, String>::attempt(|| "12x".parse::<u32>().map_err(|err| err.to_string()))
            .result::<Infallible>();
    assert!(matches!(run(attempted), Exit::Success(Err(_))));
}

#[test]
fn panics_become_defects() {
    let exit = run(Effect::<u32, Infallible>::sync(|| panic!("boom")));
    let Exit::Failure(cause) = exit else {
        unreachable!("panicking effect succeeded")
    };
    assert!(cause.died());
    assert_eq!(cause.defects()[0].message(), "boom");
}

#[test]
fn deep_continuations() {
    fn count_down(remaining: u32) -> Effect<u32, Infallible> {
        if remaining == 0 {
            Effect::succeed(0)
        } else {
            Effect::suspend(move || count_down(remaining - 1))
                .map(|total| total + 1)
        }
    }

    assert_eq!(run(count_down(100_000)), Exit::Success(100_000));
}

#[test]
fn callbacks_resume_once() {
    let (sender, receiver) = flume::unbounded();
    let program = Effect::<u32, Infallible>::async_effect(move |callback| {
        let first = callback.succeed(1);
        let second = callback.succeed(2);
        let _ = sender.send((first, second));
    });
    assert_eq!(run(program), Exit::Success(1));
    assert_eq!(receiver.try_recv(), Ok((true, false)));
}

#[test]
fn interrupted_callbacks_are_ignored() {
    let slot: Arc<Mutex<Option<Callback<u32, Infallible>>>> = Arc::default();
    let stash = slot.clone();
    let program = Effect::<u32, Infallible>::async_effect(move |callback| {
        *stash.lock() = Some(callback);
    })
    .fork::<Infallible>()
    .flat_map(|fiber| Effect::yield_now().zip_right(fiber.interrupt()));

    let Exit::Success(child) = run(program) else {
        unreachable!("parent failed")
    };
    assert!(child.is_interrupted());
    let callback = slot.lock().take().expect("callback registered");
    assert!(!callback.succeed(1));
}

#[test]
fn interrupting_a_suspended_fiber() {
    initialize_tracing();
    let program = Effect::<(), Infallible>::never()
        .fork::<Infallible>()
        .flat_map(|fiber| {
            Effect::yield_now().zip_right(Effect::sync(move || {
                let suspended = matches!(
                    fiber.status(),
                    Status::Suspended {
                        interruptible: true,
                        ..
                    }
                );
                (fiber, suspended)
            }))
        })
        .flat_map(|(fiber, suspended)| {
            Effect::fiber_id().flat_map(move |parent| {
                fiber
                    .interrupt()
                    .map(move |exit| (suspended, parent, exit))
            })
        });

    let Exit::Success((suspended, parent, child)) = run(program) else {
        unreachable!("parent failed")
    };
    assert!(suspended);
    let cause = child.cause().expect("child was interrupted");
    assert!(cause.interrupted_only());
    assert!(cause.interruptors().contains(&parent));
}

#[test]
fn uninterruptible_regions_defer_interruption() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let child = Effect::<(), Infallible>::sleep(Duration::from_millis(10))
        .zip_right(Effect::sync(move || flag.store(true, Ordering::SeqCst)))
        .uninterruptible();
    let program = child
        .fork::<Infallible>()
        .flat_map(|fiber| Effect::yield_now().zip_right(fiber.interrupt()));

    let Exit::Success(child) = run(program) else {
        unreachable!("parent failed")
    };
    assert!(finished.load(Ordering::SeqCst));
    assert!(child.is_interrupted());
}

#[test]
fn release_runs_after_interruption() {
    let released = Arc::new(AtomicUsize::new(0));
    let saw_interrupt = Arc::new(AtomicBool::new(false));
    let release_count = released.clone();
    let release_saw_interrupt = saw_interrupt.clone();
    let resource = Effect::<(), Infallible>::acquire_release(
        Effect::sync(|| 7_u32),
        |_| Effect::never(),
        move |resource, exit| {
            release_saw_interrupt.store(resource == 7 && exit.is_interrupted(), Ordering::SeqCst);
            release_count.fetch_add(1, Ordering::SeqCst);
            Effect::unit()
        },
    );
    let program = resource
        .fork::<Infallible>()
        .flat_map(|fiber| Effect::yield_now().zip_right(fiber.interrupt()));

    let Exit::Success(child) = run(program) else {
        unreachable!("parent failed")
    };
    assert!(child.is_interrupted());
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(saw_interrupt.load(Ordering::SeqCst));
}

#[test]
fn cleanup_failures_are_kept() {
    let program = Effect::<u32, Infallible>::succeed(1)
        .ensuring(Effect::die("cleanup"));
    assert!(run(program).cause().is_some_and(Cause::died));

    let program = Effect::<u32, &'static str>::fail("first")
        .ensuring(Effect::die("cleanup"));
    let exit = run(program);
    let cause = exit.cause().expect("failed");
    assert_eq!(cause.failures(), [&"first"]);
    assert!(cause.died());
}

#[test]
fn scopes_interrupt_unjoined_children() {
    let Exit::Success(fiber) = run(Effect::<(), Infallible>::never().fork::<Infallible>()) else {
        unreachable!("parent failed")
    };
    assert!(fiber.poll().is_some_and(|exit| exit.is_interrupted()));
}

#[test]
fn scope_finalizer_failures_fail_the_fiber() {
    let program = Effect::<Scope, Infallible>::fork_scope().flat_map(|scope| {
        let _ = scope.add_finalizer(|_| Effect::die("finalizer failed"));
        Effect::unit()
    });
    assert!(run(program).cause().is_some_and(Cause::died));
}

#[test]
fn closed_scopes_reject_finalizers() {
    let scope = Scope::open();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let key = scope.add_finalizer(move |_| {
        Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });
    assert!(key.is_some());
    assert_eq!(scope.finalizer_count(), 1);

    let closing = scope.clone();
    assert_eq!(
        run(closing.close(Exit::Success(Arc::new(()) as Shared))),
        Exit::Success(())
    );
    assert!(scope.is_closed());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(scope.add_finalizer(|_| Effect::unit()).is_none());

    assert_eq!(
        run(scope.close(Exit::Success(Arc::new(()) as Shared))),
        Exit::Success(())
    );
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn daemons_outlive_their_parent() {
    let scheduler = CurrentThread::new();
    let program = Effect::<(), Infallible>::sleep(Duration::from_millis(5))
        .as_value(3_u32)
        .fork_daemon::<Infallible>();
    let Exit::Success(daemon) = scheduler.block_on(program) else {
        unreachable!("parent failed")
    };
    assert!(daemon.poll().is_none());
    assert_eq!(scheduler.block_on(daemon.join()), Exit::Success(3));
}

#[test]
fn tracked_daemons_can_be_interrupted() {
    let scheduler = CurrentThread::new();
    let runtime = scheduler.runtime(RuntimeConfig {
        track_daemons: true,
        ..RuntimeConfig::default()
    });
    let exit = scheduler.block_on_in(
        &runtime,
        Effect::<(), Infallible>::never().fork_daemon::<Infallible>(),
    );
    let Exit::Success(daemon) = exit else {
        unreachable!("parent failed")
    };
    assert_eq!(runtime.live_daemons().len(), 1);

    let interrupt = runtime.interrupt_daemons::<Infallible>();
    assert_eq!(scheduler.block_on_in(&runtime, interrupt), Exit::Success(()));
    assert!(runtime.live_daemons().is_empty());
    assert!(daemon.poll().is_some_and(|exit| exit.is_interrupted()));
}

#[test]
fn race_all_finishes_with_first_success() {
    let exit = run(Effect::race_all([after(50, 1), after(5, 2), after(30, 3)]));
    assert_eq!(exit, Exit::Success(2));
}

#[test]
fn race_skips_interrupted_competitors() {
    let exit = run(Effect::<u32, &'static str>::interrupt().race(after(5, 2)));
    assert_eq!(exit, Exit::Success(2));

    let exit = run(Effect::race_all([
        Effect::<u32, &'static str>::interrupt(),
        Effect::interrupt(),
    ]));
    assert!(exit.is_interrupted());
}

#[test]
fn race_all_first_finishes_with_first_exit() {
    let exit = run(Effect::race_all_first([after(50, 1), Effect::fail("fast")]));
    assert_eq!(exit.cause().map(Cause::failures), Some(vec![&"fast"]));
}

#[test]
fn race_interrupts_losers() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let loser = Effect::<u32, &'static str>::never().on_exit(move |exit| {
        flag.store(exit.is_interrupted(), Ordering::SeqCst);
        Effect::unit()
    });
    assert_eq!(run(loser.race(after(5, 9))), Exit::Success(9));
    assert!(interrupted.load(Ordering::SeqCst));
}

#[test]
fn zip_par_keeps_order() {
    assert_eq!(run(after(20, 1).zip_par(after(5, 2))), Exit::Success((1, 2)));
    assert_eq!(
        run(after(5, 1).zip_with_par(after(20, 2), |a, b| a * 10 + b)),
        Exit::Success(12)
    );
}

#[test]
fn zip_par_interrupts_on_failure() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let right = Effect::<u32, &'static str>::never().on_exit(move |exit| {
        flag.store(exit.is_interrupted(), Ordering::SeqCst);
        Effect::unit()
    });
    let left = Effect::<(), &'static str>::sleep(Duration::from_millis(5))
        .zip_right(Effect::<u32, &'static str>::fail("boom"));

    let exit = run(left.zip_par(right));
    let cause = exit.cause().expect("zip failed");
    assert_eq!(cause.failures(), [&"boom"]);
    assert!(interrupted.load(Ordering::SeqCst));
}

#[test]
fn timeouts() {
    let stalled = Effect::<u32, Infallible>::never()
        .timeout(Duration::from_millis(5));
    assert_eq!(run(stalled), Exit::Success(None));
    let prompt = Effect::<u32, Infallible>::succeed(5)
        .timeout(Duration::from_secs(1));
    assert_eq!(run(prompt), Exit::Success(Some(5)));
}

#[test]
fn fiber_refs_are_local() {
    let fiber_ref = FiberRef::new(1_u32);
    assert_eq!(*fiber_ref.initial(), 1);
    let inner = fiber_ref.clone();
    let program = fiber_ref
        .locally(5, inner.get::<Infallible>())
        .zip(fiber_ref.get())
        .zip(fiber_ref.modify(|value| (value * 100, value + 1)))
        .zip(fiber_ref.get());
    assert_eq!(run(program), Exit::Success((((5, 1), 100), 2)));
}

#[test]
fn fiber_refs_join_only_when_joined() {
    let fiber_ref = FiberRef::with_fork_join(0_u32, |_| 0, |parent, child| parent + child);
    let child_ref = fiber_ref.clone();
    let read = fiber_ref.clone();
    let joined = fiber_ref.clone();
    let program = fiber_ref
        .set::<Infallible>(1)
        .zip_right(child_ref.update::<Infallible>(|value| value + 5).fork())
        .flat_map(move |child| {
            child
                .await_exit()
                .zip_right(read.get())
                .flat_map(move |awaited| {
                    child
                        .join()
                        .zip_right(joined.get())
                        .map(move |after_join| (awaited, after_join))
                })
        });
    assert_eq!(run(program), Exit::Success((1, 6)));
}

#[test]
fn race_winners_join_fiber_refs() {
    let fiber_ref = FiberRef::new(0_u32);
    let program = fiber_ref
        .set::<&'static str>(7)
        .zip_right(after(5, 1))
        .race(after(50, 2))
        .zip(fiber_ref.get());
    assert_eq!(run(program), Exit::Success((1, 7)));
}

#[test]
fn made_fiber_refs_start_set() {
    let program = FiberRef::make::<Infallible>(3_u32, |value| value * 2, |_, child| *child)
        .flat_map(|fiber_ref| {
            let parent = fiber_ref.clone();
            fiber_ref
                .get::<Infallible>()
                .fork()
                .flat_map(|child| child.join())
                .zip(parent.get())
        });
    assert_eq!(run(program), Exit::Success((6, 6)));
}

#[test]
fn supervisors_observe_children() {
    let tracker = Tracker::new();
    let observed = tracker.clone();
    let program = Effect::<(), Infallible>::never()
        .fork::<Infallible>()
        .zip(Effect::<(), Infallible>::never().fork())
        .flat_map(move |_| Effect::sync(move || (observed.started(), observed.live().len())))
        .supervised(tracker.clone());
    assert_eq!(run(program), Exit::Success((2, 2)));
    assert_eq!(tracker.ended(), 2);
    assert!(tracker.live().is_empty());

    let unobserved = Tracker::new();
    let program = Effect::<(), Infallible>::unit()
        .fork::<Infallible>()
        .unsupervised()
        .supervised(unobserved.clone());
    assert!(run(program).is_success());
    assert_eq!(unobserved.started(), 0);
}

#[derive(Clone)]
struct Settings {
    port: u16,
}

#[test]
fn environments_are_provided() {
    let program = Effect::<u16, Infallible>::access(|settings: &Settings| settings.port)
        .fork::<Infallible>()
        .flat_map(|fiber| fiber.join())
        .provide(Settings { port: 8080 });
    assert_eq!(run(program), Exit::Success(8080));

    let missing = Effect::<u16, Infallible>::access(|settings: &Settings| settings.port);
    assert!(run(missing).cause().is_some_and(Cause::died));
}

#[test]
fn descriptors() {
    let program = Effect::<Descriptor, Infallible>::descriptor()
        .zip(Effect::descriptor().uninterruptible());
    let Exit::Success((outer, inner)) = run(program) else {
        unreachable!("descriptor failed")
    };
    assert_eq!(outer.id, inner.id);
    assert_eq!(outer.interrupt_status, InterruptStatus::Interruptible);
    assert_eq!(inner.interrupt_status, InterruptStatus::Uninterruptible);
    assert!(outer.interruptors.is_empty());
    assert!(!outer.scope.is_closed());
}

#[test]
fn traces() {
    let program = Effect::<u32, Infallible>::succeed(1)
        .map(|value| value + 1)
        .zip_right(Effect::<Trace, Infallible>::trace())
        .zip(Effect::fiber_id());
    let Exit::Success((trace, id)) = run(program) else {
        unreachable!("trace failed")
    };
    assert_eq!(trace.fiber, id);
    assert_eq!(trace.instructions.last(), Some(&"trace"));
    assert!(trace.instructions.contains(&"flat_map"));

    let Exit::Success(untraced) = run(Effect::<Trace, Infallible>::trace().untraced()) else {
        unreachable!("trace failed")
    };
    assert!(!untraced.instructions.contains(&"trace"));
}

#[test]
fn small_budgets_still_finish() {
    let scheduler = CurrentThread::new();
    let runtime = scheduler.runtime(RuntimeConfig {
        yield_op_count: 1,
        ..RuntimeConfig::default()
    });
    let program = (0..100_u32).fold(Effect::<u32, Infallible>::succeed(0), |total, value| {
        total.map(move |total| total + value)
    });
    assert_eq!(
        scheduler.block_on_in(&runtime, program),
        Exit::Success((0..100).sum())
    );
}

#[test]
fn completing_twice_does_nothing() {
    let scheduler = CurrentThread::new();
    let runtime = scheduler.runtime(RuntimeConfig::default());
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let fiber = runtime.run(Effect::<u32, Infallible>::succeed(1), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.run_until_idle();
    assert_eq!(fiber.poll(), Some(Exit::Success(1)));

    let repeated = fiber
        .runtime_fiber()
        .context()
        .complete(&FiberRefs::default(), Exit::Success(Arc::new(2_u32) as Shared));
    assert!(repeated.is_none());
    assert_eq!(fiber.poll(), Some(Exit::Success(1)));
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[test]
fn failures_are_reported() {
    let scheduler = CurrentThread::new();
    let (sender, receiver) = flume::unbounded();
    let runtime = Runtime::new(
        Platform::new(scheduler.clone()).with_report_failure(move |cause| {
            let _ = sender.send(cause.died());
        }),
    );
    let exit = scheduler.block_on_in(&runtime, Effect::<(), Infallible>::die("broken"));
    assert!(exit.cause().is_some_and(Cause::died));
    assert_eq!(receiver.try_recv(), Ok(true));

    let (sender, receiver) = flume::unbounded();
    let program = Effect::<(), &'static str>::fail("oops")
        .fork_with_reporter::<Infallible>(move |cause| {
            let _ = sender.send(cause.failed());
        })
        .flat_map(|fiber| fiber.await_exit())
        .discard();
    assert_eq!(scheduler.block_on_in(&runtime, program), Exit::Success(()));
    assert_eq!(receiver.try_recv(), Ok(true));
}

#[test]
fn runtime_config_from_rsn() {
    let config: RuntimeConfig =
        rsn::from_str("RuntimeConfig { yield_op_count: 16, track_daemons: true }")
            .expect("valid config");
    assert_eq!(
        config,
        RuntimeConfig {
            yield_op_count: 16,
            trace_capacity: 64,
            track_daemons: true,
        }
    );
}

#[test]
fn interrupted_awaits_stop_observing() {
    let scheduler = CurrentThread::new();
    let runtime = scheduler.runtime(RuntimeConfig::default());
    let target = runtime.spawn(Effect::<(), Infallible>::never());
    let awaited = target.clone();
    let program = (0..200).fold(Effect::<(), Infallible>::unit(), move |all, _| {
        let target = awaited.clone();
        all.zip_right(
            target
                .await_exit::<Infallible>()
                .timeout(Duration::from_micros(10))
                .discard(),
        )
    });
    assert!(scheduler.block_on_in(&runtime, program).is_success());
    assert_eq!(target.runtime_fiber().context().observer_count(), 0);
    assert!(target.poll().is_none());
}

#[test]
fn inheriting_refs_from_a_running_fiber_dies() {
    let slot: Arc<Mutex<Option<Fiber<(), Infallible>>>> = Arc::default();
    let stash = slot.clone();
    let scheduler = CurrentThread::new();
    let runtime = scheduler.runtime(RuntimeConfig::default());
    let fiber = runtime.spawn(Effect::<(), Infallible>::suspend(move || {
        let me = stash.lock().take().expect("handle stored");
        me.inherit_refs()
    }));
    *slot.lock() = Some(fiber.clone());
    scheduler.run_until_idle();
    let exit = fiber.poll().expect("fiber exited");
    assert!(exit.cause().is_some_and(Cause::died));
}

#[test]
fn interruption_discards_failure_handlers() {
    let handled = Arc::new(AtomicBool::new(false));
    let flag = handled.clone();
    let child = after(20, 1)
        .zip_right(Effect::<u32, &'static str>::fail("typed"))
        .uninterruptible()
        .catch_all(move |_| {
            flag.store(true, Ordering::SeqCst);
            Effect::<u32, &'static str>::succeed(99)
        });
    let program = child.fork::<&'static str>().flat_map(|fiber| {
        Effect::sleep(Duration::from_millis(5))
            .zip_right(fiber.interrupt())
    });

    let Exit::Success(exit) = run(program) else {
        unreachable!("parent failed")
    };
    assert!(!handled.load(Ordering::SeqCst));
    let cause = exit.cause().expect("child was interrupted");
    assert!(cause.interrupted_only());
    assert!(cause.failures().is_empty());
}

#[test]
fn cause_queries() {
    let first = FiberId::next();
    let second = FiberId::next();
    let cause = Cause::fail("typed")
        .then(Cause::interrupt(first))
        .both(Cause::die("broken").then(Cause::interrupt(second)));

    assert!(!cause.is_empty());
    assert!(Cause::<&str>::Empty.then(Cause::Empty).is_empty());
    assert!(Cause::Then(Box::new(Cause::<&str>::Empty), Box::new(Cause::Empty)).is_empty());
    assert_eq!(
        cause.interruptors().iter().copied().collect::<Vec<_>>(),
        [first, second]
    );
    assert_eq!(cause.failures(), [&"typed"]);
    assert_eq!(cause.defects().len(), 1);

    let stripped = cause.clone().strip_failures();
    assert!(!stripped.failed());
    assert!(stripped.died());
    assert_eq!(stripped.interruptors().len(), 2);
    assert_eq!(
        Cause::fail("typed")
            .then(Cause::fail("other"))
            .strip_failures(),
        Cause::Empty
    );

    assert_eq!(cause.failure_or_cause(), Ok("typed"));
    let interrupted = Cause::<&str>::interrupt(first).both(Cause::die("broken"));
    assert_eq!(interrupted.clone().failure_or_cause(), Err(interrupted));
    let nested = Cause::interrupt(first)
        .then(Cause::die("broken").both(Cause::fail("late")));
    assert_eq!(nested.failure_or_cause(), Ok("late"));
}
