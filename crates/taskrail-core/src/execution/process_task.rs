use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::execution::tokio_process::{self, LineObserver, ProcessStreams};
use crate::execution::{CommandSpec, ProcessEnd, ProcessOutput};
use crate::models::{Affinity, TaskError, TaskResult};
use crate::orchestration::task::{LaunchFn, RunFn};
use crate::orchestration::{ObserverHandle, ObserverList, Task, TaskContext, TaskManager};

pub type StartObserver = dyn Fn(u32) + Send + Sync;
pub type EndObserver = dyn Fn(&ProcessEnd) + Send + Sync;

/// Writer for a process task's standard input.
///
/// Writes made before the process starts are buffered. The child's stdin is closed once
/// every writer has been dropped or closed.
#[derive(Clone, Debug)]
pub struct StandardInput {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl StandardInput {
    pub fn write(&self, data: impl AsRef<[u8]>) -> TaskResult<()> {
        self.sender
            .send(data.as_ref().to_vec())
            .map_err(|_| TaskError::invalid_state("process standard input is closed"))
    }

    pub fn write_line(&self, line: &str) -> TaskResult<()> {
        self.write(format!("{line}\n"))
    }

    pub fn close(self) {}
}

/// Builder for a task that runs an external process and yields its [`ProcessOutput`].
pub struct ProcessTask {
    manager: TaskManager,
    command: Option<CommandSpec>,
    affinity: Affinity,
    name: Option<String>,
    success_exit_codes: Vec<i32>,
    capture_output: bool,
    stdin: Option<(mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>)>,
    output_observers: ObserverList<LineObserver>,
    error_observers: ObserverList<LineObserver>,
    start_observers: ObserverList<StartObserver>,
    end_observers: ObserverList<EndObserver>,
}

impl ProcessTask {
    pub(crate) fn new(manager: TaskManager) -> Self {
        Self {
            manager,
            command: None,
            affinity: Affinity::LongRunning,
            name: None,
            success_exit_codes: vec![0],
            capture_output: true,
            stdin: None,
            output_observers: ObserverList::new(),
            error_observers: ObserverList::new(),
            start_observers: ObserverList::new(),
            end_observers: ObserverList::new(),
        }
    }

    pub fn configure(
        mut self,
        executable: impl Into<PathBuf>,
        arguments: impl IntoIterator<Item = impl Into<String>>,
        working_directory: Option<PathBuf>,
        enable_standard_input: bool,
    ) -> Self {
        let mut command = CommandSpec::new(executable).args(arguments);
        if let Some(directory) = working_directory {
            command = command.working_dir(directory);
        }
        self.command = Some(command);
        self.stdin = enable_standard_input.then(mpsc::unbounded_channel);
        self
    }

    /// Adds an argument; ignored until `configure` has been called.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        if let Some(command) = self.command.take() {
            self.command = Some(command.arg(arg));
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(command) = self.command.take() {
            self.command = Some(command.env(key, value));
        }
        self
    }

    pub fn success_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.success_exit_codes = codes.into_iter().collect();
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn standard_input(&self) -> Option<StandardInput> {
        self.stdin.as_ref().map(|(sender, _)| StandardInput {
            sender: sender.clone(),
        })
    }

    pub fn on_output_data(&mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> ObserverHandle {
        self.output_observers.add(Arc::new(observer))
    }

    pub fn on_error_data(&mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> ObserverHandle {
        self.error_observers.add(Arc::new(observer))
    }

    pub fn on_start_process(&mut self, observer: impl Fn(u32) + Send + Sync + 'static) -> ObserverHandle {
        self.start_observers.add(Arc::new(observer))
    }

    pub fn on_end_process(
        &mut self,
        observer: impl Fn(&ProcessEnd) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.end_observers.add(Arc::new(observer))
    }

    /// Removes an observer of any of the four kinds.
    pub fn remove_observer(&mut self, handle: ObserverHandle) -> bool {
        self.output_observers.remove(handle)
            || self.error_observers.remove(handle)
            || self.start_observers.remove(handle)
            || self.end_observers.remove(handle)
    }

    /// Builds the task without starting it.
    pub fn into_task(self) -> TaskResult<Task<ProcessOutput>> {
        let Some(command) = self.command else {
            return Err(TaskError::invalid_state(
                "process task must be configured before it is started",
            ));
        };
        if self.affinity == Affinity::UiThread {
            return Err(TaskError::invalid_state(
                "process tasks cannot run on the UI thread",
            ));
        }

        let name = self
            .name
            .unwrap_or_else(|| command.program.display().to_string());
        let process = ProcessLaunch {
            command,
            success_exit_codes: self.success_exit_codes,
            streams: ProcessStreams {
                stdin: self.stdin.map(|(_, receiver)| receiver),
                output_observers: self.output_observers.snapshot(),
                error_observers: self.error_observers.snapshot(),
                capture_output: self.capture_output,
            },
            start_observers: self.start_observers.snapshot(),
            end_observers: self.end_observers.snapshot(),
        };

        let launch: LaunchFn<ProcessOutput> =
            Box::new(move |context: &TaskContext| process.launch(context));
        Ok(Task::from_launch(&self.manager, self.affinity, launch).named(name))
    }

    pub fn start(self) -> TaskResult<Task<ProcessOutput>> {
        let task = self.into_task()?;
        task.start()?;
        Ok(task)
    }
}

struct ProcessLaunch {
    command: CommandSpec,
    success_exit_codes: Vec<i32>,
    streams: ProcessStreams,
    start_observers: Vec<Arc<StartObserver>>,
    end_observers: Vec<Arc<EndObserver>>,
}

impl ProcessLaunch {
    /// Spawns while the task is still queued so a missing executable never reaches `Running`.
    fn launch(self, context: &TaskContext) -> TaskResult<RunFn<ProcessOutput>> {
        let manager = context.manager();
        let handle = manager.io_handle()?;
        let environment = &manager.config().process;

        let spawned = {
            let _runtime = handle.enter();
            tokio_process::spawn(&self.command, environment, self.streams.stdin.is_some())?
        };
        let pid = spawned.pid;
        tracing::debug!(
            task_id = context.id().0,
            pid,
            program = %self.command.program.display(),
            "process started"
        );

        let mut end = EndGuard {
            end: ProcessEnd {
                pid,
                exit_code: None,
                cancelled: false,
            },
            observers: self.end_observers,
        };
        for observer in &self.start_observers {
            observer(pid);
        }

        let streams = self.streams;
        let success_exit_codes = self.success_exit_codes;
        let kill_grace = manager.config().process_kill_grace();
        Ok(Box::new(move |context: &TaskContext| {
            let started_at = spawned.started_at;
            let exit = handle.block_on(tokio_process::drive(
                spawned,
                streams,
                context.token().clone(),
                kill_grace,
            ))?;
            end.end.exit_code = exit.exit_code;
            end.end.cancelled = exit.cancelled;
            drop(end);

            tracing::debug!(
                task_id = context.id().0,
                pid,
                exit_code = ?exit.exit_code,
                cancelled = exit.cancelled,
                "process exited"
            );

            if exit.cancelled {
                return Err(TaskError::cancelled(format!("process {pid} was cancelled")));
            }

            let stderr = exit.stderr.join("\n");
            match exit.exit_code {
                Some(code) if success_exit_codes.contains(&code) => Ok(ProcessOutput {
                    exit_code: Some(code),
                    stdout: exit.stdout.join("\n"),
                    stderr,
                    pid,
                    started_at,
                    finished_at: exit.finished_at,
                }),
                code => Err(TaskError::process_failed(code, stderr)),
            }
        }))
    }
}

/// Reports the end of a spawned process exactly once, including on unwind.
struct EndGuard {
    end: ProcessEnd,
    observers: Vec<Arc<EndObserver>>,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        for observer in &self.observers {
            observer(&self.end);
        }
    }
}
