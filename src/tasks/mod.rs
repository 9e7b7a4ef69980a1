//! Task and execution records.

pub mod model;

pub use model::{
    DEFAULT_MAX_RETRIES, Execution, ExecutionOutcome, ExecutionStatus, NewTask, Task, TaskStatus,
    TaskUpdate,
};
