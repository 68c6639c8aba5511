use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::execution::ProcessEnvironment;
use crate::models::{TaskError, TaskResult};

const DEFAULT_LONG_RUNNING_WORKERS: usize = 16;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_PROCESS_KILL_GRACE_MS: u64 = 2_000;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub concurrent_workers: usize,
    pub long_running_workers: usize,
    /// How long `dispose` waits for queued work to drain.
    pub shutdown_grace_ms: u64,
    /// Time between the graceful and the forced stop of a cancelled process.
    pub process_kill_grace_ms: u64,
    pub thread_name_prefix: String,
    pub process: ProcessEnvironment,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrent_workers: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4),
            long_running_workers: DEFAULT_LONG_RUNNING_WORKERS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            process_kill_grace_ms: DEFAULT_PROCESS_KILL_GRACE_MS,
            thread_name_prefix: "taskrail".to_string(),
            process: ProcessEnvironment::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_json_str(json: &str) -> TaskResult<Self> {
        let config: ManagerConfig = serde_json::from_str(json).map_err(|error| {
            TaskError::invalid_input(format!("invalid task manager configuration: {error}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.concurrent_workers == 0 || self.long_running_workers == 0 {
            return Err(TaskError::invalid_input(
                "worker counts must be greater than zero",
            ));
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(TaskError::invalid_input(
                "thread name prefix must not be empty",
            ));
        }

        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn process_kill_grace(&self) -> Duration {
        Duration::from_millis(self.process_kill_grace_ms)
    }
}
