//! Persistence layer: libSQL-backed task catalogue and execution log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ExecutionStore, TaskStore};
