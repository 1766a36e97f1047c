//! Supporting runtime primitives: stoppable workers, interruptible
//! sleeps, connectivity probing, and the wall clock.

pub mod probe;
pub mod worker;

pub use probe::{check_connectivity, ProbeOutcome};
pub use worker::{pause, StoppableWorker};

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
