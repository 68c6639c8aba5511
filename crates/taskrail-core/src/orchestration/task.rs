use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::models::{Affinity, TaskError, TaskErrorKind, TaskId, TaskResult, TaskStatus};
use crate::orchestration::CancellationToken;
use crate::orchestration::manager::TaskManager;
use crate::orchestration::progress::ProgressReporter;
use crate::orchestration::scheduler::Scheduler;
use crate::task_context::{Deferred, run_deferred, with_task_id, without_deferral};

const WAIT_SLICE: Duration = Duration::from_millis(50);
const UI_WAIT_SLICE: Duration = Duration::from_millis(2);

pub(crate) type RunFn<T> = Box<dyn FnOnce(&TaskContext) -> TaskResult<T> + Send>;

/// First phase of a two-phase body. Runs while the task is still `Queued`; its
/// failure ends the task without it ever being `Running`.
pub(crate) type LaunchFn<T> = Box<dyn FnOnce(&TaskContext) -> TaskResult<RunFn<T>> + Send>;

enum Body<T> {
    Run(RunFn<T>),
    Launch(LaunchFn<T>),
}

#[derive(Clone, Debug)]
enum Outcome<T> {
    Succeeded(T),
    Faulted(TaskError),
    Cancelled(TaskError),
}

impl<T> Outcome<T> {
    fn status(&self) -> TaskStatus {
        match self {
            Outcome::Succeeded(_) => TaskStatus::Succeeded,
            Outcome::Faulted(_) => TaskStatus::Faulted,
            Outcome::Cancelled(_) => TaskStatus::Cancelled,
        }
    }

    fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Succeeded(_) => None,
            Outcome::Faulted(error) | Outcome::Cancelled(error) => Some(error),
        }
    }

    fn into_result(self) -> TaskResult<T> {
        match self {
            Outcome::Succeeded(value) => Ok(value),
            Outcome::Faulted(error) | Outcome::Cancelled(error) => Err(error),
        }
    }
}

/// Terminal state of the task a `finally` continuation is attached to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub task: TaskId,
    pub status: TaskStatus,
    pub error: Option<TaskError>,
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// What a running body gets to see of its task.
pub struct TaskContext {
    id: TaskId,
    name: Option<Arc<str>>,
    affinity: Affinity,
    token: CancellationToken,
    progress: ProgressReporter,
    manager: TaskManager,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_cancellation_requested()
    }

    pub fn throw_if_cancellation_requested(&self) -> TaskResult<()> {
        self.token
            .throw_if_cancellation_requested()
            .map_err(|error| error.attribute(self.id, self.name()))
    }
}

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum Route<U> {
    Run(RunFn<U>),
    Finish(Outcome<U>),
}

trait ChainLink: Send + Sync {
    fn predecessor(&self) -> Option<Arc<dyn ChainLink>>;

    fn start_head(self: Arc<Self>, require_created: bool) -> TaskResult<()>;
}

/// Walks back to the first task of the chain and starts it.
fn start_chain(link: Arc<dyn ChainLink>, require_created: bool) -> TaskResult<()> {
    let mut head = link;
    while let Some(predecessor) = head.predecessor() {
        head = predecessor;
    }
    head.start_head(require_created)
}

struct TaskInner<T> {
    id: TaskId,
    name: OnceLock<Arc<str>>,
    affinity: Affinity,
    manager: TaskManager,
    token: CancellationToken,
    progress: ProgressReporter,
    /// Set for `finally` continuations, which run even after cancellation.
    runs_when_cancelled: bool,
    state: Mutex<TaskSlot<T>>,
    finished: Condvar,
}

struct TaskSlot<T> {
    status: TaskStatus,
    body: Option<Body<T>>,
    outcome: Option<Outcome<T>>,
    continuations: Vec<Continuation<T>>,
    predecessor: Option<Arc<dyn ChainLink>>,
    waiters: usize,
    observed: bool,
}

impl<T: Clone + Send + 'static> TaskInner<T> {
    fn new(
        manager: &TaskManager,
        affinity: Affinity,
        body: Option<Body<T>>,
        predecessor: Option<Arc<dyn ChainLink>>,
        runs_when_cancelled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: manager.next_task_id(),
            name: OnceLock::new(),
            affinity,
            manager: manager.clone(),
            token: manager.token().child_token(),
            progress: ProgressReporter::new(),
            runs_when_cancelled,
            state: Mutex::new(TaskSlot {
                status: TaskStatus::Created,
                body,
                outcome: None,
                continuations: Vec::new(),
                predecessor,
                waiters: 0,
                observed: false,
            }),
            finished: Condvar::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskSlot<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn name(&self) -> Option<&str> {
        self.name.get().map(|name| &**name)
    }

    fn context(&self) -> TaskContext {
        TaskContext {
            id: self.id,
            name: self.name.get().cloned(),
            affinity: self.affinity,
            token: self.token.clone(),
            progress: self.progress.clone(),
            manager: self.manager.clone(),
        }
    }

    fn queue_head(self: Arc<Self>, require_created: bool) -> TaskResult<()> {
        let scheduler = self
            .manager
            .scheduler(self.affinity)
            .map_err(|error| error.attribute(self.id, self.name()))?;

        {
            let mut slot = self.lock();
            if slot.status != TaskStatus::Created {
                if !require_created {
                    return Ok(());
                }
                tracing::warn!(
                    task_id = self.id.0,
                    status = ?slot.status,
                    "ignoring start of a task that was already started"
                );
                return Err(TaskError::invalid_state(format!(
                    "task {} cannot be started from status '{:?}'",
                    self.id, slot.status
                ))
                .attribute(self.id, self.name()));
            }
            slot.status = TaskStatus::Queued;
        }

        tracing::debug!(
            task_id = self.id.0,
            affinity = self.affinity.as_str(),
            "task queued"
        );
        self.submit(scheduler.as_ref());
        Ok(())
    }

    fn submit(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        let work = ExecuteOnce {
            task: Some(self.clone()),
        };
        if let Err(error) = scheduler.submit(Box::new(move || work.run())) {
            // The rejected work item was dropped, which already completed the task.
            tracing::warn!(
                task_id = self.id.0,
                affinity = self.affinity.as_str(),
                message = %error.message,
                "scheduler rejected task"
            );
        }
    }

    /// Hands a continuation its body once the predecessor is terminal.
    fn deliver(self: &Arc<Self>, run: RunFn<T>) {
        {
            let mut slot = self.lock();
            if slot.status != TaskStatus::Created {
                return;
            }
            slot.body = Some(Body::Run(run));
            slot.status = TaskStatus::Queued;
        }

        match self.manager.scheduler(self.affinity) {
            Ok(scheduler) if scheduler.running_on_this_context() => self.execute(),
            Ok(scheduler) => self.submit(scheduler.as_ref()),
            Err(error) => self.complete(self.outcome_for_error(error)),
        }
    }

    fn execute(self: &Arc<Self>) {
        with_task_id(self.id, || self.execute_in_scope());
    }

    fn execute_in_scope(self: &Arc<Self>) {
        let body = {
            let mut slot = self.lock();
            if slot.status != TaskStatus::Queued {
                return;
            }
            if self.token.is_cancellation_requested() && !self.runs_when_cancelled {
                drop(slot);
                let error = TaskError::cancelled("task cancelled before it started");
                self.complete(self.outcome_for_error(error));
                return;
            }
            slot.body.take()
        };

        let Some(body) = body else {
            self.complete(self.outcome_for_error(TaskError::internal("task has no body")));
            return;
        };

        let context = self.context();
        let run = match body {
            Body::Run(run) => run,
            Body::Launch(launch) => match without_deferral(|| guarded(|| launch(&context))) {
                Ok(run) => run,
                Err(error) => {
                    self.complete(self.outcome_for_error(error));
                    return;
                }
            },
        };

        {
            let mut slot = self.lock();
            if slot.status != TaskStatus::Queued {
                return;
            }
            slot.status = TaskStatus::Running;
        }
        tracing::debug!(
            task_id = self.id.0,
            affinity = self.affinity.as_str(),
            "task running"
        );

        let outcome = match without_deferral(|| guarded(|| run(&context))) {
            Ok(value) => Outcome::Succeeded(value),
            Err(error) => self.outcome_for_error(error),
        };
        self.complete(outcome);
    }

    fn outcome_for_error(&self, error: TaskError) -> Outcome<T> {
        let error = error.attribute(self.id, self.name());
        if error.is_cancelled() {
            return Outcome::Cancelled(error);
        }
        if !self.runs_when_cancelled && self.token.is_cancellation_requested() {
            let cancelled = TaskError::cancelled(format!(
                "task failed after cancellation: {}",
                error.message
            ))
            .attribute(self.id, self.name())
            .with_inner(error);
            return Outcome::Cancelled(cancelled);
        }
        Outcome::Faulted(error)
    }

    fn complete(self: &Arc<Self>, outcome: Outcome<T>) {
        if matches!(outcome, Outcome::Succeeded(_)) && !self.is_terminal() {
            self.progress.complete();
        }

        let (continuations, unobserved) = {
            let mut slot = self.lock();
            if slot.status.is_terminal() {
                return;
            }
            slot.status = outcome.status();
            slot.outcome = Some(outcome.clone());
            slot.body = None;
            slot.predecessor = None;
            let continuations = std::mem::take(&mut slot.continuations);
            let unobserved = matches!(outcome, Outcome::Faulted(_))
                && continuations.is_empty()
                && slot.waiters == 0
                && !slot.observed;
            (continuations, unobserved)
        };
        self.finished.notify_all();

        match outcome.error() {
            None => tracing::debug!(task_id = self.id.0, "task succeeded"),
            Some(error) => tracing::debug!(
                task_id = self.id.0,
                status = ?outcome.status(),
                kind = ?error.kind,
                message = %error.message,
                "task finished without a value"
            ),
        }
        if unobserved && let Some(error) = outcome.error() {
            tracing::warn!(
                task_id = self.id.0,
                kind = ?error.kind,
                message = %error.message,
                "task faulted with no continuation or waiter"
            );
        }

        run_deferred(
            continuations
                .into_iter()
                .map(|continuation| {
                    let outcome = outcome.clone();
                    Box::new(move || continuation(outcome)) as Deferred
                })
                .collect(),
        );
    }

    /// Completes a task whose queued work item was dropped without running.
    fn abandon(self: &Arc<Self>) {
        let error = if self.token.is_cancellation_requested() {
            TaskError::cancelled("task was dropped by its scheduler")
        } else {
            TaskError::invalid_state("task was dropped by its scheduler before it ran")
        };
        self.complete(self.outcome_for_error(error));
    }

    fn attach(&self, continuation: Continuation<T>) {
        let mut slot = self.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                let deferred: Deferred = Box::new(move || continuation(outcome));
                run_deferred(vec![deferred]);
            }
            None => slot.continuations.push(continuation),
        }
    }

    fn is_terminal(&self) -> bool {
        self.lock().status.is_terminal()
    }

    fn wait(&self, timeout: Option<Duration>) -> TaskResult<T> {
        {
            let mut slot = self.lock();
            slot.waiters += 1;
            slot.observed = true;
        }
        let result = self.wait_for_outcome(timeout);
        self.lock().waiters -= 1;
        result
    }

    fn wait_for_outcome(&self, timeout: Option<Duration>) -> TaskResult<T> {
        let deadline = timeout.map(|duration| Instant::now() + duration);
        let ui = self.manager.ui_context().filter(|ui| ui.is_current());

        loop {
            if let Some(outcome) = self.lock().outcome.clone() {
                return outcome.into_result();
            }

            if let Some(ui) = &ui
                && ui.pump().unwrap_or(0) > 0
            {
                continue;
            }

            let slot = self.lock();
            if let Some(outcome) = slot.outcome.clone() {
                return outcome.into_result();
            }

            let now = Instant::now();
            if let Some(deadline) = deadline
                && now >= deadline
            {
                return Err(TaskError::new(
                    TaskErrorKind::Timeout,
                    format!("timed out waiting for task {} to complete", self.id),
                )
                .attribute(self.id, self.name()));
            }

            if self.token.is_cancellation_requested()
                && !self.runs_when_cancelled
                && matches!(slot.status, TaskStatus::Created | TaskStatus::Queued)
            {
                return Err(TaskError::cancelled(format!(
                    "task {} was cancelled before it started running",
                    self.id
                ))
                .attribute(self.id, self.name()));
            }

            let mut slice = if ui.is_some() { UI_WAIT_SLICE } else { WAIT_SLICE };
            if let Some(deadline) = deadline {
                slice = slice.min(deadline - now);
            }
            drop(
                self.finished
                    .wait_timeout(slot, slice)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
        }
    }
}

impl<T: Clone + Send + 'static> ChainLink for TaskInner<T> {
    fn predecessor(&self) -> Option<Arc<dyn ChainLink>> {
        self.lock().predecessor.clone()
    }

    fn start_head(self: Arc<Self>, require_created: bool) -> TaskResult<()> {
        self.queue_head(require_created)
    }
}

/// Queued work item; a drop without running completes the task instead of stranding it.
struct ExecuteOnce<T: Clone + Send + 'static> {
    task: Option<Arc<TaskInner<T>>>,
}

impl<T: Clone + Send + 'static> ExecuteOnce<T> {
    fn run(mut self) {
        if let Some(task) = self.task.take() {
            task.execute();
        }
    }
}

impl<T: Clone + Send + 'static> Drop for ExecuteOnce<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abandon();
        }
    }
}

fn guarded<R>(operation: impl FnOnce() -> TaskResult<R>) -> TaskResult<R> {
    catch_unwind(AssertUnwindSafe(operation)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Err(TaskError::faulted(format!("task body panicked: {message}")))
    })
}

/// Handle to a unit of work and the chain it belongs to. Clones share the task.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    pub(crate) fn from_body<F>(manager: &TaskManager, affinity: Affinity, body: F) -> Self
    where
        F: FnOnce(&TaskContext) -> TaskResult<T> + Send + 'static,
    {
        Self {
            inner: TaskInner::new(
                manager,
                affinity,
                Some(Body::Run(Box::new(body))),
                None,
                false,
            ),
        }
    }

    pub(crate) fn from_launch(manager: &TaskManager, affinity: Affinity, launch: LaunchFn<T>) -> Self {
        Self {
            inner: TaskInner::new(manager, affinity, Some(Body::Launch(launch)), None, false),
        }
    }

    /// Names the task for logs and error reports. The first name sticks.
    pub fn named(self, name: impl Into<String>) -> Self {
        let _ = self.inner.name.set(Arc::from(name.into()));
        self
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    pub fn affinity(&self) -> Affinity {
        self.inner.affinity
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.is_terminal()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.inner.progress
    }

    /// Cancels this task only; the manager and unrelated chains are unaffected.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Starts the head of the chain this task belongs to.
    ///
    /// A chain starts once. Later calls return `InvalidState` and run nothing.
    pub fn start(&self) -> TaskResult<()> {
        start_chain(self.inner.clone(), true)
    }

    pub fn result(&self) -> Option<TaskResult<T>> {
        self.inner.lock().outcome.clone().map(Outcome::into_result)
    }

    /// Blocks until the task is terminal. On the UI thread the UI context is pumped meanwhile.
    pub fn wait(&self, timeout: Option<Duration>) -> TaskResult<T> {
        self.inner.wait(timeout)
    }

    /// Starts the chain if nobody did yet and blocks for this task's result.
    pub fn run_sync(&self) -> TaskResult<T> {
        start_chain(self.inner.clone(), false)?;
        self.inner.wait(None)
    }

    /// Runs `body` with the value when this task succeeds; faults and cancellation pass through.
    pub fn then<U, F>(&self, affinity: Affinity, body: F) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T, &TaskContext) -> TaskResult<U> + Send + 'static,
    {
        self.chain(affinity, false, false, move |outcome| match outcome {
            Outcome::Succeeded(value) => {
                Route::Run(Box::new(move |context: &TaskContext| body(value, context)))
            }
            Outcome::Faulted(error) => Route::Finish(Outcome::Faulted(error)),
            Outcome::Cancelled(error) => Route::Finish(Outcome::Cancelled(error)),
        })
    }

    /// Runs `body` on success or fault. Cancellation passes through.
    pub fn then_always<U, F>(&self, affinity: Affinity, body: F) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(TaskResult<T>, &TaskContext) -> TaskResult<U> + Send + 'static,
    {
        self.chain(affinity, false, false, move |outcome| match outcome {
            Outcome::Succeeded(value) => {
                Route::Run(Box::new(move |context: &TaskContext| body(Ok(value), context)))
            }
            Outcome::Faulted(error) => {
                Route::Run(Box::new(move |context: &TaskContext| body(Err(error), context)))
            }
            Outcome::Cancelled(error) => Route::Finish(Outcome::Cancelled(error)),
        })
    }

    /// Fault handler. Returning `Ok` recovers the chain; a success passes through untouched.
    pub fn catch<F>(&self, affinity: Affinity, body: F) -> Task<T>
    where
        F: FnOnce(TaskError, &TaskContext) -> TaskResult<T> + Send + 'static,
    {
        self.chain(affinity, false, false, move |outcome| match outcome {
            Outcome::Succeeded(value) => Route::Finish(Outcome::Succeeded(value)),
            Outcome::Faulted(error) => {
                Route::Run(Box::new(move |context: &TaskContext| body(error, context)))
            }
            Outcome::Cancelled(error) => Route::Finish(Outcome::Cancelled(error)),
        })
    }

    /// Runs exactly once after this task is terminal, cancellation included.
    ///
    /// When `body` returns `Ok` the returned task mirrors this task's outcome, so an
    /// original fault is never masked. When `body` fails, its error is logged and the
    /// returned task faults with it, carrying the original fault as `inner`.
    pub fn finally<F>(&self, affinity: Affinity, body: F) -> Task<T>
    where
        F: FnOnce(&Completion, &TaskContext) -> TaskResult<()> + Send + 'static,
    {
        self.finally_task(affinity, false, body)
    }

    /// Starts the chain with a terminal `finally` that logs any fault instead of
    /// leaving it unobserved.
    pub fn fire_and_forget(&self) -> TaskResult<()> {
        self.inner.lock().observed = true;
        self.finally_task(Affinity::Concurrent, true, |completion, _| {
            if let Some(error) = &completion.error
                && error.is_fault()
            {
                tracing::error!(
                    task_id = completion.task.0,
                    kind = ?error.kind,
                    message = %error.report(),
                    "fire-and-forget task faulted"
                );
            }
            Ok(())
        });
        start_chain(self.inner.clone(), false)
    }

    fn finally_task<F>(&self, affinity: Affinity, observed: bool, body: F) -> Task<T>
    where
        F: FnOnce(&Completion, &TaskContext) -> TaskResult<()> + Send + 'static,
    {
        let source = self.inner.id;
        self.chain(affinity, true, observed, move |outcome: Outcome<T>| {
            Route::Run(Box::new(move |context: &TaskContext| {
                let completion = Completion {
                    task: source,
                    status: outcome.status(),
                    error: outcome.error().cloned(),
                };
                match body(&completion, context) {
                    Ok(()) => outcome.into_result(),
                    Err(error) => {
                        let error = error.attribute(context.id(), context.name());
                        tracing::error!(
                            task_id = context.id().0,
                            source_task_id = source.0,
                            kind = ?error.kind,
                            message = %error.message,
                            "finally handler failed"
                        );
                        Err(match completion.error {
                            Some(original) => error.with_inner(original),
                            None => error,
                        })
                    }
                }
            }))
        })
    }

    fn chain<U, F>(
        &self,
        affinity: Affinity,
        runs_when_cancelled: bool,
        observed: bool,
        route: F,
    ) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> Route<U> + Send + 'static,
    {
        let predecessor: Arc<dyn ChainLink> = self.inner.clone();
        let child = TaskInner::<U>::new(
            &self.inner.manager,
            affinity,
            None,
            Some(predecessor),
            runs_when_cancelled,
        );
        child.lock().observed = observed;

        let target = child.clone();
        self.inner.attach(Box::new(move |outcome| match route(outcome) {
            Route::Run(run) => target.deliver(run),
            Route::Finish(outcome) => target.complete(outcome),
        }));

        Task { inner: child }
    }
}

impl<T> Debug for Task<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = self
            .inner
            .state
            .lock()
            .map(|slot| slot.status)
            .unwrap_or(TaskStatus::Faulted);
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("affinity", &self.inner.affinity)
            .field("status", &status)
            .finish()
    }
}
