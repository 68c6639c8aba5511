pub mod config;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod task_context;

pub use config::ManagerConfig;
pub use models::{Affinity, Progress, TaskError, TaskErrorKind, TaskId, TaskResult, TaskStatus};
pub use orchestration::{CancellationToken, Task, TaskContext, TaskManager, UiContext};
