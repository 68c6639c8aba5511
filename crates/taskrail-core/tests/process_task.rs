#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskrail_core::config::ManagerConfig;
use taskrail_core::execution::{ProcessEnd, ProcessEnvironment};
use taskrail_core::models::{Affinity, TaskErrorKind, TaskStatus};
use taskrail_core::orchestration::{TaskManager, UiContext};

fn ready_manager() -> TaskManager {
    let config = ManagerConfig {
        process_kill_grace_ms: 500,
        ..ManagerConfig::default()
    };
    let manager = TaskManager::new(config);
    manager
        .initialize(UiContext::for_current_thread())
        .expect("initialize should succeed");
    manager
}

#[test]
fn echo_output_reaches_observers_and_result() {
    let manager = ready_manager();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(Mutex::new(Vec::new()));
    let ended = Arc::new(Mutex::new(Vec::<ProcessEnd>::new()));

    let mut process = manager
        .process()
        .configure("echo", ["hello"], None, false);
    let sink = lines.clone();
    process.on_output_data(move |line| sink.lock().unwrap().push(line.to_string()));
    let sink = started.clone();
    process.on_start_process(move |pid| sink.lock().unwrap().push(pid));
    let sink = ended.clone();
    process.on_end_process(move |end| sink.lock().unwrap().push(end.clone()));

    let output = process
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("echo should succeed");

    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout, "hello");
    assert!(output.started_at <= output.finished_at);
    assert_eq!(*lines.lock().unwrap(), vec!["hello"]);
    assert_eq!(*started.lock().unwrap(), vec![output.pid]);

    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].pid, output.pid);
    assert_eq!(ended[0].exit_code, Some(0));
    assert!(!ended[0].cancelled);
    manager.dispose();
}

#[test]
fn nonzero_exit_faults_with_code_and_stderr() {
    let manager = ready_manager();
    let error_lines = Arc::new(Mutex::new(Vec::new()));

    let mut process = manager
        .process()
        .configure("sh", ["-c", "echo boom >&2; exit 1"], None, false)
        .named("failing-shell");
    let sink = error_lines.clone();
    process.on_error_data(move |line| sink.lock().unwrap().push(line.to_string()));
    let task = process.into_task().expect("configured process should build");

    let error = task.run_sync().expect_err("exit 1 should fault");

    assert_eq!(error.kind, TaskErrorKind::ProcessFailed);
    assert_eq!(error.exit_code, Some(1));
    assert_eq!(error.detail.as_deref(), Some("boom"));
    assert_eq!(error.task, Some(task.id()));
    assert_eq!(error.task_name.as_deref(), Some("failing-shell"));
    assert_eq!(*error_lines.lock().unwrap(), vec!["boom"]);
    manager.dispose();
}

#[test]
fn missing_executable_never_fires_process_observers() {
    let manager = ready_manager();
    let observer_calls = Arc::new(AtomicUsize::new(0));

    let mut process = manager.process().configure(
        "taskrail-definitely-missing-binary",
        Vec::<String>::new(),
        None,
        false,
    );
    let counter = observer_calls.clone();
    process.on_start_process(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = observer_calls.clone();
    process.on_end_process(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let task = process.into_task().expect("configured process should build");

    let error = task.run_sync().expect_err("missing binary should fault");

    assert_eq!(error.kind, TaskErrorKind::ProcessNotFound);
    assert_eq!(task.status(), TaskStatus::Faulted);
    assert_eq!(observer_calls.load(Ordering::SeqCst), 0);
    manager.dispose();
}

#[test]
fn cancellation_kills_the_process_and_reports_its_end() {
    let manager = ready_manager();
    let (pid_tx, pid_rx) = std::sync::mpsc::channel();
    let ended = Arc::new(Mutex::new(Vec::<ProcessEnd>::new()));

    let mut process = manager.process().configure("sleep", ["30"], None, false);
    process.on_start_process(move |pid| {
        let _ = pid_tx.send(pid);
    });
    let sink = ended.clone();
    process.on_end_process(move |end| sink.lock().unwrap().push(end.clone()));
    let task = process.start().expect("process should start");

    let pid = pid_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("process should spawn");
    let cancelled_at = Instant::now();
    task.cancel();

    let error = task.wait(None).expect_err("cancelled process should not succeed");
    assert_eq!(error.kind, TaskErrorKind::Cancelled);
    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));

    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].pid, pid);
    assert!(ended[0].cancelled);
    manager.dispose();
}

#[test]
fn standard_input_written_before_start_is_delivered() {
    let manager = ready_manager();

    let process = manager
        .process()
        .configure("cat", Vec::<String>::new(), None, true);
    let stdin = process
        .standard_input()
        .expect("stdin should be enabled");
    stdin.write_line("alpha").expect("write should buffer");
    stdin.write_line("beta").expect("write should buffer");
    let task = process.into_task().expect("configured process should build");
    stdin.close();

    let output = task.run_sync().expect("cat should succeed");
    assert_eq!(output.stdout, "alpha\nbeta");
    manager.dispose();
}

#[test]
fn accepted_exit_codes_are_not_faults() {
    let manager = ready_manager();

    let output = manager
        .process()
        .configure("sh", ["-c", "exit 3"], None, false)
        .success_exit_codes([0, 3])
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("exit 3 is accepted");

    assert_eq!(output.exit_code, Some(3));
    manager.dispose();
}

#[test]
fn working_directory_and_environment_are_applied() {
    let manager = ready_manager();
    let directory = std::env::temp_dir()
        .canonicalize()
        .expect("temp dir should exist");

    let output = manager
        .process()
        .configure(
            "sh",
            ["-c", "pwd; echo \"$TASKRAIL_MODE\""],
            Some(directory.clone()),
            false,
        )
        .env("TASKRAIL_MODE", "on")
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("shell should succeed");

    let mut lines = output.stdout.lines();
    let reported = std::path::PathBuf::from(lines.next().expect("pwd should print"));
    assert_eq!(reported.canonicalize().expect("pwd should exist"), directory);
    assert_eq!(lines.next(), Some("on"));
    manager.dispose();
}

#[test]
fn output_read_before_a_held_open_pipe_is_kept() {
    let manager = ready_manager();
    let lines = Arc::new(Mutex::new(Vec::new()));

    let mut process = manager
        .process()
        .configure("sh", ["-c", "echo hello; sleep 2 &"], None, false);
    let sink = lines.clone();
    process.on_output_data(move |line| sink.lock().unwrap().push(line.to_string()));

    let begun = Instant::now();
    let output = process
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("shell should succeed");

    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(output.stdout, "hello");
    assert_eq!(*lines.lock().unwrap(), vec!["hello"]);
    manager.dispose();
}

#[test]
fn configured_environment_reaches_every_process() {
    let config = ManagerConfig {
        process: ProcessEnvironment::from_system().variable("TASKRAIL_GREETING", "hi"),
        ..ManagerConfig::default()
    };
    let manager = TaskManager::new(config);
    manager
        .initialize(UiContext::for_current_thread())
        .expect("initialize should succeed");

    let output = manager
        .process()
        .configure("sh", ["-c", "echo \"$TASKRAIL_GREETING\""], None, false)
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("shell should succeed");

    assert_eq!(output.stdout, "hi");
    manager.dispose();
}

#[test]
fn uncaptured_output_still_reaches_observers() {
    let manager = ready_manager();
    let lines = Arc::new(Mutex::new(Vec::new()));

    let mut process = manager
        .process()
        .configure("printf", ["one\\ntwo\\n"], None, false)
        .capture_output(false);
    let sink = lines.clone();
    process.on_output_data(move |line| sink.lock().unwrap().push(line.to_string()));

    let output = process
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("printf should succeed");

    assert!(output.stdout.is_empty());
    assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    manager.dispose();
}

#[test]
fn process_output_feeds_a_continuation() {
    let manager = ready_manager();

    let next = manager
        .process()
        .configure("echo", ["42"], None, false)
        .into_task()
        .expect("configured process should build")
        .then(Affinity::Concurrent, |output, _| {
            let value: i32 = output
                .stdout
                .trim()
                .parse()
                .map_err(|_| taskrail_core::models::TaskError::invalid_input("not a number"))?;
            Ok(value + 1)
        })
        .run_sync()
        .expect("chain should succeed");

    assert_eq!(next, 43);
    manager.dispose();
}

#[test]
fn unconfigured_or_ui_bound_process_is_rejected() {
    let manager = ready_manager();

    let error = manager
        .process()
        .into_task()
        .expect_err("unconfigured process should fail");
    assert_eq!(error.kind, TaskErrorKind::InvalidState);

    let error = manager
        .process()
        .configure("echo", ["ui"], None, false)
        .affinity(Affinity::UiThread)
        .into_task()
        .expect_err("UI affinity should be rejected");
    assert_eq!(error.kind, TaskErrorKind::InvalidState);
    manager.dispose();
}

#[test]
fn removed_line_observer_is_not_called() {
    let manager = ready_manager();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut process = manager.process().configure("echo", ["quiet"], None, false);
    let counter = calls.clone();
    let handle = process.on_output_data(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    process.on_end_process(|_| {});
    assert!(process.remove_observer(handle));
    assert!(!process.remove_observer(handle));

    let output = process
        .into_task()
        .expect("configured process should build")
        .run_sync()
        .expect("echo should succeed");

    assert_eq!(output.stdout, "quiet");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    manager.dispose();
}
