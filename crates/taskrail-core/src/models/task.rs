use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Execution context a task body is pinned to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// The single host-pumped context.
    UiThread,
    Concurrent,
    /// Dedicated single worker, strict FIFO.
    Exclusive,
    /// Background worker sized for blocking calls.
    LongRunning,
}

impl Affinity {
    pub const ALL: [Affinity; 4] = [
        Affinity::UiThread,
        Affinity::Concurrent,
        Affinity::Exclusive,
        Affinity::LongRunning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Affinity::UiThread => "ui",
            Affinity::Concurrent => "concurrent",
            Affinity::Exclusive => "exclusive",
            Affinity::LongRunning => "long-running",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Succeeded,
    Faulted,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Faulted | TaskStatus::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Affinity, TaskStatus};

    #[test]
    fn only_outcome_states_are_terminal() {
        assert!(!TaskStatus::Created.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Faulted.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn affinity_serializes_as_snake_case() {
        let encoded = serde_json::to_string(&Affinity::LongRunning).unwrap();
        assert_eq!(encoded, "\"long_running\"");
    }
}
