use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand::reactor::{Reactor, ReactorHandle};
use strand::{Callback, Effect, Exit, FiberRef, Scope, Shared};
use tracing_subscriber::filter::LevelFilter;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn reactor() -> ReactorHandle {
    initialize_tracing();
    Reactor::build().threads(4).finish()
}

fn delay(millis: u64) -> Effect<(), Infallible> {
    Effect::sleep(Duration::from_millis(millis))
}

#[test]
fn brackets_release_after_interruption() {
    let reactor = reactor();
    let acquired = Arc::new(AtomicBool::new(false));
    let released = Arc::new(AtomicUsize::new(0));

    let program = Effect::<(), Infallible>::acquire_release(
        Effect::sync({
            let acquired = acquired.clone();
            move || acquired.store(true, Ordering::SeqCst)
        }),
        |()| delay(100),
        {
            let released = released.clone();
            move |(), _exit| {
                Effect::sync(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
            }
        },
    );
    let interrupted = program
        .fork::<Infallible>()
        .flat_map(|fiber| delay(10).zip_right(fiber.interrupt()));

    let Exit::Success(exit) = reactor.block_on(interrupted).unwrap() else {
        unreachable!("parent failed")
    };
    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(exit.is_interrupted());
    reactor.shutdown().unwrap();
}

#[test]
fn callbacks_resume_at_most_once() {
    let reactor = reactor();
    let (sender, receiver) = flume::unbounded();
    let program = Effect::<u32, Infallible>::async_effect(
        move |callback: Callback<u32, Infallible>| {
            let racing = callback.clone();
            let other = std::thread::spawn(move || racing.succeed(1));
            let local = callback.succeed(2);
            let remote = other.join().unwrap_or(false);
            let _ = sender.send(u8::from(local) + u8::from(remote));
            // Both completions above happened before this one.
            let late = callback.resume(Effect::die("resumed a completed suspension"));
            let _ = sender.send(u8::from(late));
        },
    );
    let exit = reactor.block_on(program).unwrap();
    assert!(matches!(exit, Exit::Success(1 | 2)));
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(1));
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(0));
    reactor.shutdown().unwrap();
}

#[test]
fn closing_a_scope_interrupts_children_once_interruptible() {
    fn alternate() -> Effect<(), Infallible> {
        delay(2)
            .uninterruptible()
            .zip_right(Effect::yield_now().interruptible())
            .flat_map(|()| alternate())
    }

    let reactor = reactor();
    let scope = Scope::open();
    let program = alternate()
        .fork_in::<Infallible>(scope.clone())
        .flat_map(move |fiber| {
            delay(5)
                .zip_right(scope.close(Exit::Success(Arc::new(()) as Shared)))
                .zip_right(fiber.await_exit())
        });

    let exit = reactor
        .spawn(program)
        .unwrap()
        .try_join_for(Duration::from_secs(5))
        .expect("scope closed");
    let Exit::Success(child) = exit else {
        unreachable!("parent failed")
    };
    assert!(child.is_interrupted());
    reactor.shutdown().unwrap();
}

#[test]
fn sequential_and_concurrent_ordering() {
    let reactor = reactor();

    let record = |sender: flume::Sender<&'static str>, name: &'static str, millis: u64| {
        delay(millis).zip_right(Effect::sync(move || {
            let _ = sender.send(name);
        }))
    };

    let (sender, receiver) = flume::unbounded();
    let sequential = record(sender.clone(), "a", 5).zip(record(sender, "b", 1));
    assert!(reactor.block_on(sequential).unwrap().is_success());
    assert_eq!(receiver.try_iter().collect::<Vec<_>>(), ["a", "b"]);

    let (sender, receiver) = flume::unbounded();
    let concurrent = record(sender.clone(), "a", 50).zip_par(record(sender, "b", 1));
    assert!(reactor.block_on(concurrent).unwrap().is_success());
    assert_eq!(receiver.try_iter().collect::<Vec<_>>(), ["b", "a"]);

    reactor.shutdown().unwrap();
}

#[test]
fn race_all_surfaces_failures_immediately() {
    let reactor = reactor();
    let interrupted = Arc::new(AtomicBool::new(false));
    let slow = Effect::<(), &'static str>::sleep(Duration::from_millis(500))
        .as_value(1_u32)
        .on_exit({
            let interrupted = interrupted.clone();
            move |exit| {
                interrupted.store(exit.is_interrupted(), Ordering::SeqCst);
                Effect::unit()
            }
        });
    let failing = Effect::<u32, &'static str>::fail("failed");

    let start = Instant::now();
    let exit = reactor
        .block_on(Effect::race_all([failing, slow]))
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(exit.cause().map(|cause| cause.failures()), Some(vec![&"failed"]));
    assert!(interrupted.load(Ordering::SeqCst));

    let quick = Effect::<(), &'static str>::sleep(Duration::from_millis(5)).as_value(2_u32);
    let late_failure = Effect::<(), &'static str>::sleep(Duration::from_millis(200))
        .zip_right(Effect::<u32, &'static str>::fail("late"));
    let exit = reactor
        .block_on(Effect::race_all_first([late_failure, quick]))
        .unwrap();
    assert_eq!(exit, Exit::Success(2));

    reactor.shutdown().unwrap();
}

#[test]
fn fiber_ref_joins() {
    let reactor = reactor();

    let identity = FiberRef::new(String::from("initial"));
    let read = identity.clone();
    let program = identity
        .get::<Infallible>()
        .fork::<Infallible>()
        .flat_map(|child| child.join())
        .zip_right(read.get());
    assert_eq!(
        reactor.block_on(program).unwrap(),
        Exit::Success(String::from("initial"))
    );

    let total = FiberRef::with_fork_join(0_u64, |_| 0, |parent, child| parent + child);
    let children = (1..=10_u64)
        .map(|amount| {
            total
                .update::<Infallible>(move |value| value + amount)
                .fork::<Infallible>()
        })
        .fold(Effect::succeed(Vec::new()), |all, fiber| {
            all.zip_with(fiber, |mut all, fiber| {
                all.push(fiber);
                all
            })
        });
    let awaited = total.clone();
    let joined = total.clone();
    let program = children.flat_map(move |children| {
        let waiting = children.clone();
        waiting
            .into_iter()
            .fold(Effect::unit(), |all, child| {
                all.zip_right(child.await_exit().discard())
            })
            .zip_right(awaited.get())
            .flat_map(move |after_await| {
                children
                    .into_iter()
                    .fold(Effect::unit(), |all, child| all.zip_right(child.join()))
                    .zip_right(joined.get())
                    .map(move |after_join| (after_await, after_join))
            })
    });
    assert_eq!(reactor.block_on(program).unwrap(), Exit::Success((0, 55)));

    reactor.shutdown().unwrap();
}

#[test]
fn tasks_are_futures() {
    let reactor = reactor();
    let task = reactor
        .spawn(delay(5).as_value(String::from("joined")))
        .unwrap();
    assert_eq!(
        pollster::block_on(&task),
        Exit::Success(String::from("joined"))
    );
    reactor.shutdown().unwrap();
}
