//! Fiber identities.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// The identity of a fiber.
///
/// Two ids are equal when both their sequence number and start time are
/// equal. Sequence numbers are allocated from a process-wide counter, so in
/// practice the sequence number alone is unique within a process.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct FiberId {
    /// The process-wide sequence number of this fiber.
    pub sequence: u64,
    /// The wall-clock time this fiber was created at, in milliseconds since
    /// the Unix epoch.
    pub start_millis: u64,
}

impl FiberId {
    /// The id used for interruptions that don't originate from a fiber.
    pub const NONE: Self = Self {
        sequence: 0,
        start_millis: 0,
    };

    /// Allocates the next fiber id.
    #[must_use]
    pub fn next() -> Self {
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
            });
        Self {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            start_millis,
        }
    }

    /// Returns true if this is [`FiberId::NONE`].
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.sequence == 0 && self.start_millis == 0
    }
}

impl Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("#none")
        } else {
            write!(f, "#{}", self.sequence)
        }
    }
}
