// Task status values exchanged with the manager, plus the precedence used
// when folding command outcomes into a task verdict.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Status of a render task, serialized in lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// `completed`, `failed` and `canceled` end a task's life on this worker.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Combine the verdict so far with a newly observed one, keeping the
    /// more severe. `canceled` outranks `failed`, which outranks `completed`.
    pub fn merge(current: Option<TaskStatus>, coming: TaskStatus) -> TaskStatus {
        match current {
            None => coming,
            Some(current) if current.severity() >= coming.severity() => current,
            Some(_) => coming,
        }
    }

    fn severity(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Canceled => 4,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            other => anyhow::bail!("unknown task status '{other}'"),
        }
    }
}
