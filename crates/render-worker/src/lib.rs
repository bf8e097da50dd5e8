// render-worker: the render farm worker's task-execution engine.
// Depends on `render-sdk` and `render-common`.
//
// Architecture:
//   TaskScheduler::run → WorkerIdentity::register_if_needed / sign_on
//     → fetch loop → CommandExecutor::execute → per-command CommandHandler
//     → StatusReporter (FIFO, at-least-once) → sign_off

pub mod commands;
pub mod error;
pub mod error_throttler;
pub mod executor;
pub mod identity;
pub mod manager_client;
pub mod reporter;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod test_support;

pub use commands::{CommandContext, CommandHandler, CommandOutcome, CommandRegistry};
pub use error::{ManagerError, WorkerError};
pub use executor::{CommandExecutor, ExecutionResult};
pub use identity::WorkerIdentity;
pub use manager_client::{Credentials, HttpManagerClient, ManagerClient, ManagerResponse};
pub use reporter::StatusReporter;
pub use scheduler::{SchedulerHandle, SchedulerState, TaskScheduler};
pub use task::{Command, MayKeepRunning, Task, TaskUpdate};
