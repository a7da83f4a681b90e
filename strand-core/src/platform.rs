//! Runtime-wide configuration shared by every fiber.

use std::sync::Arc;

use kempt::Map;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cause::Cause;
use crate::fiber::RuntimeFiber;
use crate::id::FiberId;
use crate::instruction::Shared;
use crate::scheduler::Scheduler;

/// Invoked with the cause of every fiber that exits with a failure other than
/// a pure interruption.
pub type ReportFailure = Arc<dyn Fn(&Cause<Shared>) + Send + Sync>;

/// Tunable settings for a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// The number of instructions a fiber executes before yielding its
    /// thread back to the scheduler. Values below 1 are treated as 1.
    pub yield_op_count: usize,
    /// The number of recent instructions each fiber records while tracing is
    /// enabled.
    pub trace_capacity: usize,
    /// Whether fibers forked into the global scope are tracked so that they
    /// can be listed and interrupted through the runtime.
    pub track_daemons: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            yield_op_count: 2048,
            trace_capacity: 64,
            track_daemons: false,
        }
    }
}

/// The scheduler, configuration and reporting hooks fibers run with.
#[derive(Clone)]
pub struct Platform {
    scheduler: Arc<dyn Scheduler>,
    config: RuntimeConfig,
    report_failure: ReportFailure,
    daemons: Option<Arc<Daemons>>,
}

impl Platform {
    /// Returns a platform that executes fibers on `scheduler` with the
    /// default configuration.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            config: RuntimeConfig::default(),
            report_failure: Arc::new(log_failure),
            daemons: None,
        }
    }

    /// Applies `config` to this platform.
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.daemons = if config.track_daemons {
            Some(self.daemons.unwrap_or_default())
        } else {
            None
        };
        self.config = config;
        self
    }

    /// Replaces the function unhandled failures are reported to.
    #[must_use]
    pub fn with_report_failure(
        mut self,
        report: impl Fn(&Cause<Shared>) + Send + Sync + 'static,
    ) -> Self {
        self.report_failure = Arc::new(report);
        self
    }

    pub(crate) fn with_reporter(mut self, report: ReportFailure) -> Self {
        self.report_failure = report;
        self
    }

    /// Returns the scheduler fibers are executed on.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Returns the configuration of this platform.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn yield_op_count(&self) -> usize {
        self.config.yield_op_count.max(1)
    }

    pub(crate) fn report_failure(&self, cause: &Cause<Shared>) {
        (self.report_failure)(cause);
    }

    pub(crate) fn daemons(&self) -> Option<&Arc<Daemons>> {
        self.daemons.as_ref()
    }
}

fn log_failure(cause: &Cause<Shared>) {
    if cause.died() {
        warn!(%cause, "fiber died");
    } else {
        debug!(%cause, "fiber failed");
    }
}

/// Fibers running in the global scope.
#[derive(Default)]
pub(crate) struct Daemons {
    live: Mutex<Map<FiberId, RuntimeFiber>>,
}

impl Daemons {
    pub fn register(self: &Arc<Self>, fiber: &RuntimeFiber) {
        self.live.lock().insert(fiber.id(), fiber.clone());
        let daemons = Arc::downgrade(self);
        let id = fiber.id();
        fiber.on_done(move |_| {
            if let Some(daemons) = daemons.upgrade() {
                daemons.live.lock().remove(&id);
            }
        });
    }

    pub fn live(&self) -> Vec<RuntimeFiber> {
        self.live
            .lock()
            .iter()
            .map(|field| field.value.clone())
            .collect()
    }
}
