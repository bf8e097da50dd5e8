// Wire types for tasks handed out by the manager and the updates sent back.

use render_common::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A unit of work assigned to this worker.
///
/// Unknown fields are ignored; missing identifiers default to empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub job: String,

    #[serde(default)]
    pub manager: String,

    #[serde(default)]
    pub project: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub name: String,

    /// The manager's own status for the task, e.g. `queued`, `active` or
    /// `claimed-by-manager`. Kept verbatim; the worker never acts on it.
    #[serde(default = "default_status")]
    pub status: String,

    #[serde(default)]
    pub priority: i64,

    pub job_type: String,

    /// Executed strictly in order.
    #[serde(default)]
    pub commands: Vec<Command>,
}

fn default_status() -> String {
    TaskStatus::Queued.to_string()
}

/// One named operation of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,

    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl Command {
    pub fn new(name: impl Into<String>, settings: Value) -> Self {
        Self {
            name: name.into(),
            settings: match settings {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

/// Body of `POST /task/{id}/status`. Absent fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn activity(activity: impl Into<String>) -> Self {
        Self {
            activity: Some(activity.into()),
            ..Self::default()
        }
    }

    pub fn log(log: impl Into<String>) -> Self {
        Self {
            log: Some(log.into()),
            ..Self::default()
        }
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }
}

/// Answer of `GET /may-i-run/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MayKeepRunning {
    pub may_keep_running: bool,

    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_manager_task() {
        let task: Task = serde_json::from_value(json!({
            "_id": "58514d1e9837734f2e71b479",
            "job": "58514d1e9837734f2e71b477",
            "manager": "585a795698377345814d2f68",
            "project": "",
            "user": "580f8c66983773759afdb20e",
            "name": "sleep-14-26",
            "status": "processing",
            "priority": 50,
            "job_type": "sleep",
            "etag": "ignored",
            "commands": [
                {"name": "echo", "settings": {"message": "Preparing to sleep"}},
                {"name": "sleep", "settings": {"time_in_seconds": 3}}
            ]
        }))
        .unwrap();

        assert_eq!(task.id, "58514d1e9837734f2e71b479");
        assert_eq!(task.status, "processing");
        assert_eq!(task.priority, 50);
        assert_eq!(task.commands.len(), 2);
        assert_eq!(task.commands[1].name, "sleep");
        assert_eq!(task.commands[1].settings["time_in_seconds"], json!(3));
    }

    #[test]
    fn test_decode_manager_only_statuses() {
        for status in ["active", "claimed-by-manager", "cancel-requested"] {
            let task: Task = serde_json::from_value(json!({
                "_id": "t1",
                "job_type": "sleep",
                "status": status,
                "commands": []
            }))
            .unwrap();
            assert_eq!(task.status, status);
        }
    }

    #[test]
    fn test_minimal_task_defaults() {
        let task: Task =
            serde_json::from_value(json!({"_id": "t1", "job_type": "sleep"})).unwrap();
        assert_eq!(task.status, "queued");
        assert!(task.commands.is_empty());
        assert!(task.job.is_empty());
    }

    #[test]
    fn test_task_without_id_is_rejected() {
        assert!(serde_json::from_value::<Task>(json!({"job_type": "sleep"})).is_err());
    }

    #[test]
    fn test_update_omits_absent_fields() {
        let update = TaskUpdate::status(TaskStatus::Completed).with_activity("done");
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"status": "completed", "activity": "done"})
        );
        assert!(update.is_terminal());
        assert!(!TaskUpdate::log("line").is_terminal());
    }

    #[test]
    fn test_may_keep_running() {
        let answer: MayKeepRunning =
            serde_json::from_value(json!({"may_keep_running": false, "reason": "job paused"}))
                .unwrap();
        assert!(!answer.may_keep_running);
        assert_eq!(answer.reason.as_deref(), Some("job paused"));
    }
}
