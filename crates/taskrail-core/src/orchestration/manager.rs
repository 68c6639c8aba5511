use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use tokio::runtime::Handle;

use crate::config::ManagerConfig;
use crate::execution::ProcessTask;
use crate::models::{Affinity, TaskError, TaskId, TaskResult};
use crate::orchestration::list_task::{ItemSink, ListTask};
use crate::orchestration::scheduler::{
    ExclusiveScheduler, PoolScheduler, Scheduler, UiContext, UiScheduler,
};
use crate::orchestration::{CancellationToken, Task, TaskContext};

static DEFAULT_MANAGER: OnceLock<TaskManager> = OnceLock::new();

/// Owns the schedulers and the cancellation token shared by every task it creates.
///
/// Instances are independent; nothing is global except the optional default instance
/// installed by the application entry point.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    token: CancellationToken,
    next_task_id: AtomicU64,
    state: RwLock<ManagerState>,
}

enum ManagerState {
    Created,
    Ready(Schedulers),
    Disposed,
}

#[derive(Clone)]
struct Schedulers {
    ui: Arc<UiScheduler>,
    concurrent: Arc<PoolScheduler>,
    exclusive: Arc<ExclusiveScheduler>,
    long_running: Arc<PoolScheduler>,
}

impl Schedulers {
    fn get(&self, affinity: Affinity) -> Arc<dyn Scheduler> {
        match affinity {
            Affinity::UiThread => self.ui.clone(),
            Affinity::Concurrent => self.concurrent.clone(),
            Affinity::Exclusive => self.exclusive.clone(),
            Affinity::LongRunning => self.long_running.clone(),
        }
    }
}

impl TaskManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                token: CancellationToken::new(),
                next_task_id: AtomicU64::new(1),
                state: RwLock::new(ManagerState::Created),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ManagerConfig::default())
    }

    /// Attaches the UI context and starts the background schedulers.
    pub fn initialize(&self, ui: UiContext) -> TaskResult<()> {
        self.inner.config.validate()?;

        let mut state = self.write_state();
        match *state {
            ManagerState::Created => {}
            ManagerState::Ready(_) => {
                return Err(TaskError::invalid_state("task manager is already initialized"));
            }
            ManagerState::Disposed => {
                return Err(TaskError::invalid_state("task manager has been disposed"));
            }
        }

        let config = &self.inner.config;
        let prefix = config.thread_name_prefix.as_str();
        let schedulers = Schedulers {
            ui: Arc::new(UiScheduler::new(ui)),
            concurrent: Arc::new(PoolScheduler::new(
                Affinity::Concurrent,
                config.concurrent_workers,
                prefix,
            )?),
            exclusive: Arc::new(ExclusiveScheduler::new(prefix)?),
            long_running: Arc::new(PoolScheduler::new(
                Affinity::LongRunning,
                config.long_running_workers,
                prefix,
            )?),
        };
        *state = ManagerState::Ready(schedulers);

        tracing::debug!(
            concurrent_workers = config.concurrent_workers,
            long_running_workers = config.long_running_workers,
            "task manager initialized"
        );
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.read_state(), ManagerState::Ready(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.read_state(), ManagerState::Disposed)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Cancels every task of this manager; schedulers stay up.
    pub fn stop(&self) {
        self.inner.token.cancel();
    }

    pub fn ui_context(&self) -> Option<UiContext> {
        match &*self.read_state() {
            ManagerState::Ready(schedulers) => Some(schedulers.ui.context().clone()),
            _ => None,
        }
    }

    pub fn scheduler(&self, affinity: Affinity) -> TaskResult<Arc<dyn Scheduler>> {
        self.inner.scheduler(affinity)
    }

    /// Cancels the token, drains queued work within the grace period and releases the pools.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Creates an unstarted task that produces a value.
    pub fn task<T, F>(&self, affinity: Affinity, body: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&TaskContext) -> TaskResult<T> + Send + 'static,
    {
        Task::from_body(self, affinity, body)
    }

    pub fn action<F>(&self, affinity: Affinity, body: F) -> Task<()>
    where
        F: FnOnce(&TaskContext) -> TaskResult<()> + Send + 'static,
    {
        Task::from_body(self, affinity, body)
    }

    pub fn list_task<T, F>(&self, affinity: Affinity, body: F) -> ListTask<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&TaskContext, &mut ItemSink<T>) -> TaskResult<()> + Send + 'static,
    {
        ListTask::new(self.clone(), affinity, body)
    }

    /// Unconfigured process task; call `configure` before turning it into a task.
    pub fn process(&self) -> ProcessTask {
        ProcessTask::new(self.clone())
    }

    /// Makes `manager` reachable through [`TaskManager::default_instance`]. Only the first call wins.
    pub fn install_default(manager: TaskManager) -> TaskResult<()> {
        DEFAULT_MANAGER
            .set(manager)
            .map_err(|_| TaskError::invalid_state("a default task manager is already installed"))
    }

    pub fn default_instance() -> Option<TaskManager> {
        DEFAULT_MANAGER.get().cloned()
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        TaskId(self.inner.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Runtime handle used to drive process I/O.
    pub(crate) fn io_handle(&self) -> TaskResult<Handle> {
        match &*self.read_state() {
            ManagerState::Ready(schedulers) => Ok(schedulers.long_running.handle().clone()),
            ManagerState::Created => Err(not_ready()),
            ManagerState::Disposed => Err(disposed()),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.inner.read_state()
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ManagerState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ManagerInner {
    fn scheduler(&self, affinity: Affinity) -> TaskResult<Arc<dyn Scheduler>> {
        match &*self.read_state() {
            ManagerState::Ready(schedulers) => Ok(schedulers.get(affinity)),
            ManagerState::Created => Err(not_ready()),
            ManagerState::Disposed => Err(disposed()),
        }
    }

    fn dispose(&self) {
        self.token.cancel();

        let schedulers = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match std::mem::replace(&mut *state, ManagerState::Disposed) {
                ManagerState::Ready(schedulers) => Some(schedulers),
                _ => None,
            }
        };
        let Some(schedulers) = schedulers else {
            return;
        };

        // Lock released: abandoned work completes tasks, which looks schedulers up again.
        let grace = self.config.shutdown_grace();
        schedulers.ui.shutdown(grace);
        schedulers.exclusive.shutdown(grace);
        schedulers.concurrent.shutdown(grace);
        schedulers.long_running.shutdown(grace);
        tracing::debug!("task manager disposed");
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn not_ready() -> TaskError {
    TaskError::not_ready("task manager is not initialized")
}

fn disposed() -> TaskError {
    TaskError::invalid_state("task manager has been disposed")
}

#[cfg(test)]
mod tests {
    use super::TaskManager;
    use crate::models::{Affinity, TaskErrorKind};
    use crate::orchestration::scheduler::UiContext;

    #[test]
    fn schedulers_are_unavailable_before_initialize() {
        let manager = TaskManager::with_defaults();
        let error = manager.scheduler(Affinity::Concurrent).err().unwrap();
        assert_eq!(error.kind, TaskErrorKind::NotReady);
        assert!(manager.ui_context().is_none());
    }

    #[test]
    fn initialize_twice_is_invalid_state() {
        let manager = TaskManager::with_defaults();
        manager.initialize(UiContext::for_current_thread()).unwrap();
        let error = manager
            .initialize(UiContext::for_current_thread())
            .unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidState);
        manager.dispose();
    }

    #[test]
    fn dispose_cancels_token_and_rejects_further_use() {
        let manager = TaskManager::with_defaults();
        manager.initialize(UiContext::for_current_thread()).unwrap();
        manager.dispose();
        manager.dispose();

        assert!(manager.token().is_cancellation_requested());
        assert!(manager.is_disposed());
        let error = manager.scheduler(Affinity::Exclusive).err().unwrap();
        assert_eq!(error.kind, TaskErrorKind::InvalidState);
    }

    #[test]
    fn task_ids_are_per_instance() {
        let first = TaskManager::with_defaults();
        let second = TaskManager::with_defaults();
        assert_eq!(first.next_task_id().0, 1);
        assert_eq!(first.next_task_id().0, 2);
        assert_eq!(second.next_task_id().0, 1);
    }
}
