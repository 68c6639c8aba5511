use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

use crate::models::{Affinity, TaskError, TaskResult};
use crate::task_context::{current_affinity, current_scheduler, with_worker};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// One execution context tasks can be submitted to.
pub trait Scheduler: Send + Sync {
    fn affinity(&self) -> Affinity;

    fn submit(&self, work: Work) -> TaskResult<()>;

    /// True when the calling thread already belongs to this context.
    fn running_on_this_context(&self) -> bool;

    fn shutdown(&self, grace_period: Duration);
}

fn next_scheduler_id() -> u64 {
    NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)
}

fn run_work(affinity: Affinity, scheduler: u64, work: Work) {
    let outcome = catch_unwind(AssertUnwindSafe(|| with_worker(affinity, scheduler, work)));
    if outcome.is_err() {
        tracing::error!(
            affinity = affinity.as_str(),
            "work item panicked on scheduler thread"
        );
    }
}

fn closed_error(affinity: Affinity) -> TaskError {
    TaskError::invalid_state(format!(
        "{} scheduler is shut down and no longer accepts work",
        affinity.as_str()
    ))
}

/// Work queue owned by the host's UI thread and drained by [`UiContext::pump`].
#[derive(Clone)]
pub struct UiContext {
    inner: Arc<UiQueue>,
}

struct UiQueue {
    id: u64,
    thread: ThreadId,
    queue: Mutex<VecDeque<Work>>,
    closed: AtomicBool,
}

impl UiContext {
    /// Declares the calling thread as the UI thread.
    pub fn for_current_thread() -> Self {
        Self {
            inner: Arc::new(UiQueue {
                id: next_scheduler_id(),
                thread: std::thread::current().id(),
                queue: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.inner.thread
    }

    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Runs the work queued before this call; anything queued meanwhile waits for the next pass.
    pub fn pump(&self) -> TaskResult<usize> {
        if !self.is_current() {
            return Err(TaskError::invalid_state(
                "the UI context can only be pumped from its own thread",
            ));
        }

        let batch: Vec<Work> = {
            let mut queue = self.lock_queue();
            let count = queue.len();
            queue.drain(..count).collect()
        };

        let executed = batch.len();
        for work in batch {
            run_work(Affinity::UiThread, self.inner.id, work);
        }
        Ok(executed)
    }

    fn push(&self, work: Work) -> TaskResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(closed_error(Affinity::UiThread));
        }
        self.lock_queue().push_back(work);
        Ok(())
    }

    fn close(&self) -> VecDeque<Work> {
        self.inner.closed.store(true, Ordering::SeqCst);
        std::mem::take(&mut *self.lock_queue())
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Work>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct UiScheduler {
    context: UiContext,
}

impl UiScheduler {
    pub fn new(context: UiContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &UiContext {
        &self.context
    }
}

impl Scheduler for UiScheduler {
    fn affinity(&self) -> Affinity {
        Affinity::UiThread
    }

    fn submit(&self, work: Work) -> TaskResult<()> {
        self.context.push(work)
    }

    fn running_on_this_context(&self) -> bool {
        self.context.is_current()
    }

    fn shutdown(&self, _grace_period: Duration) {
        if self.context.is_current() {
            let _ = self.context.pump();
        }
        let stranded = self.context.close();
        if !stranded.is_empty() {
            tracing::debug!(
                count = stranded.len(),
                "dropping UI work queued after the last pump"
            );
        }
    }
}

/// Background pool backed by the blocking threads of a dedicated tokio runtime.
pub struct PoolScheduler {
    id: u64,
    affinity: Affinity,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl PoolScheduler {
    pub fn new(affinity: Affinity, workers: usize, thread_name_prefix: &str) -> TaskResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name(format!("{thread_name_prefix}-{}", affinity.as_str()))
            .enable_all()
            .build()
            .map_err(|error| {
                TaskError::internal(format!(
                    "failed to build {} worker pool: {error}",
                    affinity.as_str()
                ))
            })?;
        let handle = runtime.handle().clone();

        Ok(Self {
            id: next_scheduler_id(),
            affinity,
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    /// Async handle of the pool, used for process I/O.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Scheduler for PoolScheduler {
    fn affinity(&self) -> Affinity {
        self.affinity
    }

    fn submit(&self, work: Work) -> TaskResult<()> {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(runtime) = runtime.as_ref() else {
            return Err(closed_error(self.affinity));
        };

        let (affinity, id) = (self.affinity, self.id);
        runtime.spawn_blocking(move || run_work(affinity, id, work));
        Ok(())
    }

    fn running_on_this_context(&self) -> bool {
        current_scheduler() == Some(self.id)
    }

    fn shutdown(&self, grace_period: Duration) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        // Blocking is not allowed inside another runtime, and a pool thread would wait on itself.
        if current_affinity().is_some() || Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(grace_period);
        }
    }
}

/// Single dedicated thread draining a FIFO queue.
pub struct ExclusiveScheduler {
    id: u64,
    sender: Mutex<Option<mpsc::UnboundedSender<Work>>>,
    worker: Mutex<Option<(JoinHandle<()>, std::sync::mpsc::Receiver<()>)>>,
}

impl ExclusiveScheduler {
    pub fn new(thread_name_prefix: &str) -> TaskResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Work>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let id = next_scheduler_id();

        let join = std::thread::Builder::new()
            .name(format!(
                "{thread_name_prefix}-{}",
                Affinity::Exclusive.as_str()
            ))
            .spawn(move || {
                while let Some(work) = receiver.blocking_recv() {
                    run_work(Affinity::Exclusive, id, work);
                }
                let _ = done_tx.send(());
            })
            .map_err(|error| {
                TaskError::internal(format!("failed to start exclusive worker: {error}"))
            })?;

        Ok(Self {
            id,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some((join, done_rx))),
        })
    }
}

impl Scheduler for ExclusiveScheduler {
    fn affinity(&self) -> Affinity {
        Affinity::Exclusive
    }

    fn submit(&self, work: Work) -> TaskResult<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(closed_error(Affinity::Exclusive));
        };
        sender
            .send(work)
            .map_err(|_| closed_error(Affinity::Exclusive))
    }

    fn running_on_this_context(&self) -> bool {
        current_scheduler() == Some(self.id)
    }

    fn shutdown(&self, grace_period: Duration) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((join, done)) = worker else {
            return;
        };

        if self.running_on_this_context() {
            return;
        }

        match done.recv_timeout(grace_period) {
            Ok(()) => {
                let _ = join.join();
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace_period.as_millis() as u64,
                    "exclusive worker did not drain within the grace period"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{ExclusiveScheduler, PoolScheduler, Scheduler, UiContext, UiScheduler};
    use crate::models::{Affinity, TaskErrorKind};
    use crate::task_context::current_affinity;

    fn explode() {
        panic!("boom");
    }

    #[test]
    fn pump_runs_only_work_queued_before_the_pass() {
        let context = UiContext::for_current_thread();
        let scheduler = Arc::new(UiScheduler::new(context.clone()));
        let runs = Arc::new(AtomicUsize::new(0));

        let requeue = scheduler.clone();
        let counter = runs.clone();
        scheduler
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let counter = counter.clone();
                requeue
                    .submit(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
            }))
            .unwrap();

        assert_eq!(context.pump().unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(context.pending(), 1);

        assert_eq!(context.pump().unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pump_from_another_thread_is_rejected() {
        let context = UiContext::for_current_thread();
        let remote = context.clone();
        let error = std::thread::spawn(move || remote.pump().unwrap_err())
            .join()
            .unwrap();
        assert_eq!(error.kind, TaskErrorKind::InvalidState);
    }

    #[test]
    fn ui_work_sees_ui_affinity() {
        let context = UiContext::for_current_thread();
        let scheduler = UiScheduler::new(context.clone());
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        scheduler
            .submit(Box::new(move || *slot.lock().unwrap() = current_affinity()))
            .unwrap();
        context.pump().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Affinity::UiThread));
        assert!(scheduler.running_on_this_context());
    }

    #[test]
    fn exclusive_scheduler_preserves_submission_order() {
        let scheduler = ExclusiveScheduler::new("test").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..20 {
            let order = order.clone();
            scheduler
                .submit(Box::new(move || order.lock().unwrap().push(index)))
                .unwrap();
        }

        scheduler.shutdown(Duration::from_secs(5));

        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
        let error = scheduler.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidState);
    }

    #[test]
    fn pool_work_runs_with_pool_affinity_and_survives_panics() {
        let scheduler = PoolScheduler::new(Affinity::Concurrent, 2, "test").unwrap();
        scheduler.submit(Box::new(explode)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        scheduler
            .submit(Box::new(move || {
                let _ = tx.send(current_affinity());
            }))
            .unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, Some(Affinity::Concurrent));
        assert!(!scheduler.running_on_this_context());

        scheduler.shutdown(Duration::from_secs(1));
        assert!(scheduler.submit(Box::new(|| {})).is_err());
    }

    #[test]
    fn same_affinity_pools_do_not_claim_each_others_threads() {
        let first = Arc::new(PoolScheduler::new(Affinity::Concurrent, 1, "first").unwrap());
        let second = Arc::new(PoolScheduler::new(Affinity::Concurrent, 1, "second").unwrap());

        let (tx, rx) = std::sync::mpsc::channel();
        let (own, other) = (first.clone(), second.clone());
        first
            .submit(Box::new(move || {
                let _ = tx.send((own.running_on_this_context(), other.running_on_this_context()));
            }))
            .unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, (true, false));
        first.shutdown(Duration::from_secs(1));
        second.shutdown(Duration::from_secs(1));
    }
}
