use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand_core::effect::Effect;
use strand_core::exit::Exit;
use strand_core::platform::RuntimeConfig;
use strand_core::supervisor::Tracker;
use tracing_subscriber::filter::LevelFilter;

use crate::{Reactor, ReactorConfig};

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

#[test]
fn works() {
    initialize_tracing();
    let reactor = Reactor::new();
    let task = reactor
        .spawn(Effect::<u32, Infallible>::succeed(1).map(|value| value + 2))
        .unwrap();
    assert_eq!(task.join(), Exit::Success(3));
    reactor.shutdown().unwrap();
}

#[test]
fn forking() {
    fn sum(n: u64) -> Effect<u64, Infallible> {
        if n == 0 {
            Effect::succeed(0)
        } else {
            sum(n - 1)
                .fork::<Infallible>()
                .flat_map(move |child| child.join().map(move |total| total + n))
        }
    }

    initialize_tracing();
    let reactor = Reactor::build().threads(4).finish();
    assert_eq!(
        reactor.block_on(sum(100)).unwrap(),
        Exit::Success((0..=100).sum())
    );
    reactor.shutdown().unwrap();
}

#[test]
fn sleeping() {
    initialize_tracing();
    let reactor = Reactor::build().threads(2).finish();
    let start = Instant::now();
    let task = reactor
        .spawn(
            Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                .zip_par(Effect::<(), Infallible>::sleep(Duration::from_millis(50))),
        )
        .unwrap();
    assert_eq!(task.join(), Exit::Success(((), ())));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(5));
    reactor.shutdown().unwrap();
}

#[test]
fn cancellation() {
    initialize_tracing();
    let reactor = Reactor::new();
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let task = reactor
        .spawn(
            Effect::<(), Infallible>::never().ensuring(Effect::sync(move || {
                flag.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();

    // Make sure the task doesn't complete on its own
    assert!(task.try_join_for(Duration::from_millis(100)).is_none());

    task.cancel();
    assert!(task.join().is_interrupted());
    assert!(released.load(Ordering::SeqCst));
    reactor.shutdown().unwrap();
}

#[test]
fn timeouts() {
    initialize_tracing();
    let reactor = Reactor::new();
    let exit = reactor
        .block_on(Effect::<u32, Infallible>::never().timeout(Duration::from_millis(20)))
        .unwrap();
    assert_eq!(exit, Exit::Success(None));
    reactor.shutdown().unwrap();
}

#[test]
fn async_join() {
    initialize_tracing();
    let reactor = Reactor::new();
    let task = reactor
        .spawn(
            Effect::<(), Infallible>::sleep(Duration::from_millis(10))
                .as_value(String::from("done")),
        )
        .unwrap();
    assert_eq!(
        pollster::block_on(&task),
        Exit::Success(String::from("done"))
    );
    reactor.shutdown().unwrap();
}

#[test]
fn supervised_children_end_with_parent() {
    initialize_tracing();
    let reactor = Reactor::build().threads(3).finish();
    let tracker = Tracker::new();
    let program = Effect::<(), Infallible>::never()
        .fork::<Infallible>()
        .zip(Effect::<(), Infallible>::never().fork())
        .discard()
        .supervised(tracker.clone());
    assert!(reactor.block_on(program).unwrap().is_success());
    assert_eq!(tracker.started(), 2);
    assert_eq!(tracker.ended(), 2);
    reactor.shutdown().unwrap();
}

#[test]
fn reported_failures() {
    initialize_tracing();
    let (sender, receiver) = flume::unbounded();
    let reactor = Reactor::build()
        .report_failure(move |cause| {
            let _ = sender.send(cause.died());
        })
        .finish();
    let exit = reactor
        .block_on(Effect::<(), Infallible>::sync(|| panic!("broken")))
        .unwrap();
    assert!(exit.cause().is_some_and(|cause| cause.died()));
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(true));
    reactor.shutdown().unwrap();
}

#[test]
fn spawning_after_shutdown() {
    let reactor = Reactor::build().threads(1).finish();
    reactor.shutdown().unwrap();
    assert!(reactor.spawn(Effect::<(), Infallible>::unit()).is_err());
    // Shutting down twice is harmless.
    reactor.shutdown().unwrap();
}

#[test]
fn config_from_rsn() {
    let config: ReactorConfig = rsn::from_str(
        r#"ReactorConfig {
            threads: 2,
            thread_name: "workers",
            runtime: RuntimeConfig { yield_op_count: 8 },
        }"#,
    )
    .unwrap();
    assert_eq!(config.threads, 2);
    assert_eq!(config.thread_name, "workers");
    assert_eq!(config.work_queue_limit, None);
    assert_eq!(
        config.runtime,
        RuntimeConfig {
            yield_op_count: 8,
            ..RuntimeConfig::default()
        }
    );

    let reactor = Reactor::build()
        .threads(1)
        .runtime_config(config.runtime.clone())
        .finish();
    assert_eq!(reactor.runtime().platform().config(), &config.runtime);
    let reactor_from_config = crate::Builder::from_config(config).finish();
    assert_eq!(
        reactor_from_config
            .block_on(Effect::<u32, Infallible>::succeed(5))
            .unwrap(),
        Exit::Success(5)
    );
    reactor.shutdown().unwrap();
    reactor_from_config.shutdown().unwrap();
}
