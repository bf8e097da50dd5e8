// Command handlers: the operations a task's command list can name.
//
// Handlers are looked up by command name in a `CommandRegistry`. Each one
// receives the command's settings and a `CommandContext` carrying the
// cancellation token and a sink for log lines and activity text.

pub mod basic;
pub mod blender;
pub mod exec;
pub mod file;

use async_trait::async_trait;
use render_sdk::{ProcessInvoker, TraceWriter};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Settings object of a command.
pub type Settings = Map<String, Value>;

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded { output: Option<String> },
    Failed { reason: String },
    Canceled,
}

impl CommandOutcome {
    pub fn success() -> Self {
        CommandOutcome::Succeeded { output: None }
    }

    pub fn success_with(output: impl Into<String>) -> Self {
        CommandOutcome::Succeeded {
            output: Some(output.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        CommandOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded { .. })
    }
}

/// Something a running command wants the manager to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// A line for the task log.
    Log(String),
    /// Replaces the task's activity text, e.g. render progress.
    Activity(String),
}

/// What a handler gets besides its settings.
pub struct CommandContext {
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<CommandEvent>,
    work_directory: PathBuf,
}

impl CommandContext {
    pub fn new(
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<CommandEvent>,
        work_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cancel,
            events,
            work_directory: work_directory.into(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Directory subprocesses start in.
    pub fn work_directory(&self) -> &Path {
        &self.work_directory
    }

    pub fn log(&self, line: impl Into<String>) {
        let _ = self.events.send(CommandEvent::Log(line.into()));
    }

    pub fn activity(&self, text: impl Into<String>) {
        let _ = self.events.send(CommandEvent::Activity(text.into()));
    }
}

/// One kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command. Long waits must observe `context.cancel_token()`.
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome;
}

/// Handler table keyed by command name.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in command.
    pub fn with_builtin_commands(trace: Arc<dyn TraceWriter>) -> Self {
        let invoker = Arc::new(ProcessInvoker::new(trace));
        let mut registry = Self::new();
        registry.register("echo", basic::EchoCommand);
        registry.register("sleep", basic::SleepCommand);
        registry.register("exec", exec::ExecCommand::new(invoker.clone()));
        registry.register("blender_render", blender::BlenderRenderCommand::new(invoker));
        registry.register("move_out_of_way", file::MoveOutOfWayCommand);
        registry.register("copy_file", file::CopyFileCommand);
        registry.register("remove_tree", file::RemoveTreeCommand);
        registry.register("create_directory", file::CreateDirectoryCommand);
        registry
    }

    /// Add or replace the handler for `name`.
    pub fn register<H: CommandHandler + 'static>(&mut self, name: &str, handler: H) {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// A required string setting.
pub(crate) fn required_str<'a>(settings: &'a Settings, key: &str) -> Result<&'a str, String> {
    match settings.get(key) {
        None | Some(Value::Null) => Err(format!("missing setting \"{key}\"")),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) => Err(format!("setting \"{key}\" must not be empty")),
        Some(_) => Err(format!("setting \"{key}\" must be a string")),
    }
}

/// An optional string setting.
pub(crate) fn optional_str<'a>(settings: &'a Settings, key: &str) -> Result<Option<&'a str>, String> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(format!("setting \"{key}\" must be a string")),
    }
}

/// A required non-negative number. Numeric strings are accepted.
pub(crate) fn required_number(settings: &Settings, key: &str) -> Result<f64, String> {
    let value = match settings.get(key) {
        None | Some(Value::Null) => return Err(format!("missing setting \"{key}\"")),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(format!("setting \"{key}\" must be a non-negative number")),
    }
}
