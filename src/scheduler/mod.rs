//! Scheduling core: cron evaluation, the polling loop and the execution worker.

pub mod cron;
pub mod engine;
mod worker;

pub use self::cron::{next_due, upcoming, validate};
pub use self::engine::{SchedulerEngine, TickSummary};
