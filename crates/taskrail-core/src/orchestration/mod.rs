pub mod cancellation;
pub mod list_task;
pub mod manager;
pub mod observers;
pub mod progress;
pub mod scheduler;
pub mod task;

pub use cancellation::{CallbackHandle, CancellationToken};
pub use list_task::{ItemSink, ListTask};
pub use manager::TaskManager;
pub use observers::{ObserverHandle, ObserverList};
pub use progress::{ProgressListener, ProgressReporter};
pub use scheduler::{
    ExclusiveScheduler, PoolScheduler, Scheduler, UiContext, UiScheduler, Work,
};
pub use task::{Completion, Task, TaskContext};
