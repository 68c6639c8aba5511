use crate::models::TaskId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TaskErrorKind {
    /// Manager or scheduler used before `initialize`.
    NotReady,
    InvalidState,
    InvalidInput,
    Cancelled,
    Faulted,
    ProcessFailed,
    ProcessNotFound,
    Timeout,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TaskError {
    pub task: Option<TaskId>,
    pub task_name: Option<String>,
    pub kind: TaskErrorKind,
    pub message: String,
    pub exit_code: Option<i32>,
    /// Captured standard error for process failures.
    pub detail: Option<String>,
    /// Fault that was already in flight when this one was raised.
    pub inner: Option<Box<TaskError>>,
}

pub type TaskResult<T> = Result<T, TaskError>;

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            task_name: None,
            kind,
            message: message.into(),
            exit_code: None,
            detail: None,
            inner: None,
        }
    }

    pub fn faulted(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Faulted, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Cancelled, message)
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::NotReady, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InvalidState, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InvalidInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Internal, message)
    }

    pub fn process_not_found(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::ProcessNotFound, message)
    }

    pub fn process_failed(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        let detail = stderr.into();
        let message = match exit_code {
            Some(code) => format!("process exited with code {code}"),
            None => "process terminated by signal".to_string(),
        };
        Self {
            exit_code,
            detail: (!detail.trim().is_empty()).then_some(detail),
            ..Self::new(TaskErrorKind::ProcessFailed, message)
        }
    }

    pub fn with_inner(mut self, inner: TaskError) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Stamps the failing task onto the error unless an upstream stage already did.
    pub fn attribute(mut self, task: TaskId, task_name: Option<&str>) -> Self {
        if self.task.is_none() {
            self.task = Some(task);
            self.task_name = task_name.map(str::to_string);
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TaskErrorKind::Cancelled
    }

    pub fn is_fault(&self) -> bool {
        matches!(
            self.kind,
            TaskErrorKind::Faulted | TaskErrorKind::ProcessFailed | TaskErrorKind::ProcessNotFound
        )
    }

    /// Human readable report: innermost message, failing stage, process details.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        if let Some(task) = self.task {
            match &self.task_name {
                Some(name) => out.push_str(&format!(" (task {task} '{name}')")),
                None => out.push_str(&format!(" (task {task})")),
            }
        }
        if let Some(detail) = &self.detail {
            out.push_str(&format!("\nstderr: {}", detail.trim_end()));
        }
        if let Some(inner) = &self.inner {
            out.push_str(&format!("\nwhile handling: {}", inner.report()));
        }
        out
    }
}
