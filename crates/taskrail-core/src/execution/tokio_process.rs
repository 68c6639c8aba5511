use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::execution::{CommandSpec, ProcessEnvironment, ProcessTerminationMode};
use crate::models::{TaskError, TaskErrorKind, TaskResult};
use crate::orchestration::CancellationToken;

/// Bounded window for draining pipes after exit; descendants may keep the fds open.
const READ_DEADLINE: Duration = Duration::from_millis(250);

pub type LineObserver = dyn Fn(&str) + Send + Sync;

pub(crate) struct SpawnedProcess {
    child: Child,
    pub pid: u32,
    pub started_at: SystemTime,
}

pub(crate) struct ProcessStreams {
    pub stdin: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    pub output_observers: Vec<Arc<LineObserver>>,
    pub error_observers: Vec<Arc<LineObserver>>,
    pub capture_output: bool,
}

pub(crate) struct ProcessExit {
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub finished_at: SystemTime,
}

/// Spawns `command` in its own process group. Must be called inside a runtime context.
pub(crate) fn spawn(
    command: &CommandSpec,
    environment: &ProcessEnvironment,
    standard_input: bool,
) -> TaskResult<SpawnedProcess> {
    command.validate()?;

    let program = environment
        .resolve_executable(&command.program)
        .ok_or_else(|| {
            TaskError::process_not_found(format!(
                "executable '{}' was not found",
                command.program.display()
            ))
        })?;

    let working_dir = command
        .working_dir
        .as_ref()
        .or(environment.default_working_dir.as_ref());
    if let Some(dir) = working_dir
        && !dir.is_dir()
    {
        return Err(TaskError::invalid_input(format!(
            "working directory '{}' does not exist",
            dir.display()
        )));
    }

    let mut cmd = Command::new(&program);
    cmd.args(&command.args);

    for (key, value) in &environment.variables {
        cmd.env(key, value);
    }
    if let Some(path) = environment.exported_path() {
        cmd.env(&environment.path_variable, path);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(if standard_input {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|error| match error.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            TaskError::process_not_found(format!(
                "failed to spawn '{}': {error}",
                program.display()
            ))
        }
        _ => TaskError::new(
            TaskErrorKind::ProcessFailed,
            format!("failed to spawn '{}': {error}", program.display()),
        ),
    })?;

    Ok(SpawnedProcess {
        pid: child.id().unwrap_or_default(),
        started_at: SystemTime::now(),
        child,
    })
}

/// Pumps stdin, reads both output streams line by line and waits for exit or cancellation.
pub(crate) async fn drive(
    process: SpawnedProcess,
    streams: ProcessStreams,
    token: CancellationToken,
    kill_grace: Duration,
) -> TaskResult<ProcessExit> {
    let SpawnedProcess {
        mut child, pid, ..
    } = process;

    if let (Some(mut stdin), Some(mut chunks)) = (child.stdin.take(), streams.stdin) {
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });
    }

    let stdout_reader = child.stdout.take().map(|stream| {
        LineReader::spawn(stream, streams.output_observers, streams.capture_output)
    });
    let stderr_reader = child
        .stderr
        .take()
        .map(|stream| LineReader::spawn(stream, streams.error_observers, true));

    let mode = if kill_grace.is_zero() {
        ProcessTerminationMode::Immediate
    } else {
        ProcessTerminationMode::Graceful {
            grace_period: kill_grace,
        }
    };
    let (status, cancelled) = tokio::select! {
        status = child.wait() => (status, false),
        () = token.cancelled() => (stop(&mut child, pid, mode).await, true),
    };
    let status = status.map_err(|error| {
        TaskError::new(
            TaskErrorKind::ProcessFailed,
            format!("failed to wait for process {pid}: {error}"),
        )
    })?;

    let stdout = LineReader::finish(stdout_reader, pid, "stdout").await;
    let stderr = LineReader::finish(stderr_reader, pid, "stderr").await;

    Ok(ProcessExit {
        exit_code: status.code(),
        cancelled,
        stdout,
        stderr,
        finished_at: SystemTime::now(),
    })
}

/// Line-by-line reader whose kept lines survive the reader being cut off.
struct LineReader {
    handle: JoinHandle<()>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl LineReader {
    fn spawn<R>(stream: R, observers: Vec<Arc<LineObserver>>, keep: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let kept = lines.clone();
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                for observer in &observers {
                    observer(&line);
                }
                if keep {
                    kept.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(line);
                }
            }
        });
        Self { handle, lines }
    }

    /// Waits out the read deadline, then returns whatever was read so far.
    async fn finish(reader: Option<Self>, pid: u32, stream: &'static str) -> Vec<String> {
        let Some(mut reader) = reader else {
            return Vec::new();
        };
        if tokio::time::timeout(READ_DEADLINE, &mut reader.handle)
            .await
            .is_err()
        {
            reader.handle.abort();
            tracing::warn!(
                pid,
                stream,
                deadline_ms = READ_DEADLINE.as_millis() as u64,
                "stream still open after exit; keeping the lines read so far"
            );
        }
        std::mem::take(
            &mut *reader
                .lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

async fn stop(
    child: &mut Child,
    pid: u32,
    mode: ProcessTerminationMode,
) -> std::io::Result<ExitStatus> {
    tracing::debug!(pid, ?mode, "stopping cancelled process");

    if let ProcessTerminationMode::Graceful { grace_period } = mode
        && terminate(pid, mode).is_ok()
        && let Ok(status) = tokio::time::timeout(grace_period, child.wait()).await
    {
        return status;
    }

    if let Err(error) = terminate(pid, ProcessTerminationMode::Immediate) {
        tracing::warn!(pid, message = %error.message, "failed to kill process group");
    }
    let _ = child.start_kill();
    child.wait().await
}

/// Signals the whole process group; a group that is already gone counts as success.
#[cfg(unix)]
pub(crate) fn terminate(pid: u32, mode: ProcessTerminationMode) -> TaskResult<()> {
    if pid == 0 {
        return Ok(());
    }

    let signal = match mode {
        ProcessTerminationMode::Immediate => libc::SIGKILL,
        ProcessTerminationMode::Graceful { .. } => libc::SIGTERM,
    };

    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(TaskError::internal(format!(
                "failed to send signal {signal} to process group {pid}: {os_error}"
            )));
        }
    }

    Ok(())
}

/// Without process groups there is no graceful signal; the caller falls back to a kill.
#[cfg(not(unix))]
pub(crate) fn terminate(_pid: u32, mode: ProcessTerminationMode) -> TaskResult<()> {
    match mode {
        ProcessTerminationMode::Immediate => Ok(()),
        ProcessTerminationMode::Graceful { .. } => Err(TaskError::internal(
            "graceful termination is not supported on this platform",
        )),
    }
}
