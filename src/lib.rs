//! Cron Scheduler: polls persisted task definitions and runs the due ones.

pub mod config;
pub mod error;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod tasks;
