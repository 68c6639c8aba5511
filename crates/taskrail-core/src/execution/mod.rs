pub mod environment;
pub mod process_task;
pub mod tokio_process;

pub use environment::ProcessEnvironment;
pub use process_task::{ProcessTask, StandardInput};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::models::{TaskError, TaskResult};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(TaskError::invalid_input(
                "command program path must not be empty",
            ));
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(TaskError::invalid_input(
                "command args must not contain NUL bytes",
            ));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(TaskError::invalid_input(
                "environment keys must be non-empty and keys and values must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTerminationMode {
    Graceful { grace_period: Duration },
    Immediate,
}

/// Result of a process task that exited with an accepted code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output lines joined with `\n`; empty when capture is off.
    pub stdout: String,
    pub stderr: String,
    pub pid: u32,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

/// Passed to end-of-process observers once the child has been reaped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessEnd {
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}
