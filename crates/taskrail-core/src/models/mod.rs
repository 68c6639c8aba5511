pub mod error;
pub mod progress;
pub mod task;

pub use error::{TaskError, TaskErrorKind, TaskResult};
pub use progress::Progress;
pub use task::{Affinity, TaskId, TaskStatus};
