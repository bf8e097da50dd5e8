// CommandExecutor: runs a task's commands strictly in order and reduces
// their outcomes to the task's terminal status.
//
// While a command runs, its log lines are written to the local task log and
// batched to the manager every `log_flush_interval`; activity changes are
// reported as they happen. Those mid-command reports give way to
// cancellation, so a slow manager cannot hold up stopping the command; an
// update cut short stays queued in the reporter.

use crate::commands::{CommandContext, CommandEvent, CommandOutcome, CommandRegistry};
use crate::reporter::StatusReporter;
use crate::task::{Task, TaskUpdate};
use render_common::constants::unsupported_command_reason;
use render_common::{HostContext, TaskLogger, TaskStatus, WellKnownDirectory, WorkerSettings};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a task ended, ready to be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: TaskStatus,
    pub activity: String,
}

impl ExecutionResult {
    fn new(status: TaskStatus, activity: impl Into<String>) -> Self {
        Self {
            status,
            activity: activity.into(),
        }
    }
}

/// Log lines of the running command, on their way to disk and the manager.
struct TaskLog {
    task_id: String,
    logger: Option<TaskLogger>,
    pending: Vec<String>,
}

impl TaskLog {
    fn push(&mut self, line: String) {
        if let Some(logger) = self.logger.as_mut() {
            logger.write(&line);
        }
        self.pending.push(line);
    }

    async fn flush(&mut self, reporter: &mut StatusReporter) {
        if let Some(logger) = self.logger.as_mut() {
            logger.flush();
        }
        if self.pending.is_empty() {
            return;
        }
        let log = self.pending.join("\n");
        self.pending.clear();
        reporter.report(&self.task_id, TaskUpdate::log(log)).await;
    }
}

pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    settings: Arc<WorkerSettings>,
    context: Arc<HostContext>,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<CommandRegistry>,
        settings: Arc<WorkerSettings>,
        context: Arc<HostContext>,
    ) -> Self {
        Self {
            registry,
            settings,
            context,
        }
    }

    /// Run every command of `task` until one fails or `cancel` fires.
    ///
    /// Progress goes out through `reporter`; the terminal status is returned,
    /// not reported, so the caller decides how to deliver it.
    pub async fn execute(
        &self,
        task: &Task,
        reporter: &mut StatusReporter,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        if !self
            .settings
            .supported_job_types
            .iter()
            .any(|t| t == &task.job_type)
        {
            tracing::warn!(
                "Task {} has job type {:?}, which this worker does not support",
                task.id,
                task.job_type
            );
            return ExecutionResult::new(
                TaskStatus::Failed,
                format!(
                    "job type \"{}\" is not supported by this worker",
                    task.job_type
                ),
            );
        }

        let logger = TaskLogger::new(
            &self.context.get_directory(WellKnownDirectory::TaskLogs),
            &task.id,
            self.context.secret_masker.clone(),
        )
        .map_err(|e| tracing::warn!("No local log for task {}: {:#}", task.id, e))
        .ok();
        let mut log = TaskLog {
            task_id: task.id.clone(),
            logger,
            pending: Vec::new(),
        };

        let work_directory = self.context.get_directory(WellKnownDirectory::Work);
        if let Err(e) = tokio::fs::create_dir_all(&work_directory).await {
            tracing::warn!("Cannot create work directory {:?}: {}", work_directory, e);
        }

        tracing::info!(
            "Executing task {} ({}) with {} command(s)",
            task.id,
            task.name,
            task.commands.len()
        );
        reporter
            .report(
                &task.id,
                TaskUpdate::status(TaskStatus::Processing).with_activity("Task started"),
            )
            .await;

        let total = task.commands.len();
        let mut status: Option<TaskStatus> = None;
        let mut activity = String::from("Task completed");

        for (index, command) in task.commands.iter().enumerate() {
            let label = format!("command {}/{}: {}", index + 1, total, command.name);

            if cancel.is_cancelled() {
                log.push(format!("Task canceled before {label}"));
                status = Some(TaskStatus::Canceled);
                activity = format!("canceled before {label}");
                break;
            }

            log.push(format!("Running {label}"));
            reporter
                .report(&task.id, TaskUpdate::activity(format!("running {label}")))
                .await;

            let Some(handler) = self.registry.get(&command.name) else {
                let reason = unsupported_command_reason(&command.name);
                log.push(format!("{label} failed: {reason}"));
                status = Some(TaskStatus::merge(status, TaskStatus::Failed));
                activity = format!("{label} failed: {reason}");
                break;
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            let command_context = CommandContext::new(cancel.clone(), tx, &work_directory);
            let run = handler.execute(&command.settings, &command_context);
            tokio::pin!(run);

            let period = self.settings.log_flush_interval();
            let mut flush = interval_at(Instant::now() + period, period);
            flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let outcome = loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    Some(event) = rx.recv() => match event {
                        CommandEvent::Log(line) => log.push(line),
                        CommandEvent::Activity(text) => {
                            tokio::select! {
                                biased;
                                _ = reporter.report(&task.id, TaskUpdate::activity(text)) => {}
                                _ = cancel.cancelled() => {}
                            }
                        }
                    },
                    _ = flush.tick() => {
                        tokio::select! {
                            biased;
                            _ = log.flush(reporter) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
            };
            while let Ok(event) = rx.try_recv() {
                handle_event(event, &task.id, &mut log, reporter).await;
            }

            match outcome {
                CommandOutcome::Succeeded { output } => {
                    let text = output.unwrap_or_else(|| format!("finished {label}"));
                    log.push(format!("Finished {label}"));
                    log.flush(reporter).await;
                    reporter
                        .report(&task.id, TaskUpdate::activity(text.as_str()))
                        .await;
                    status = Some(TaskStatus::merge(status, TaskStatus::Completed));
                    activity = text;
                }
                CommandOutcome::Failed { reason } => {
                    log.push(format!("{label} failed: {reason}"));
                    status = Some(TaskStatus::merge(status, TaskStatus::Failed));
                    activity = format!("{label} failed: {reason}");
                    break;
                }
                CommandOutcome::Canceled => {
                    log.push(format!("{label} was canceled"));
                    status = Some(TaskStatus::merge(status, TaskStatus::Canceled));
                    activity = format!("canceled during {label}");
                    break;
                }
            }

            if cancel.is_cancelled() && index + 1 < total {
                status = Some(TaskStatus::merge(status, TaskStatus::Canceled));
                activity = format!("canceled after {label}");
                break;
            }
        }

        log.flush(reporter).await;
        if let Some(logger) = log.logger.as_mut() {
            logger.end();
        }

        let status = status.unwrap_or(TaskStatus::Completed);
        tracing::info!("Task {} finished with status {}: {}", task.id, status, activity);
        ExecutionResult::new(status, activity)
    }
}

async fn handle_event(
    event: CommandEvent,
    task_id: &str,
    log: &mut TaskLog,
    reporter: &mut StatusReporter,
) {
    match event {
        CommandEvent::Log(line) => log.push(line),
        CommandEvent::Activity(text) => {
            reporter.report(task_id, TaskUpdate::activity(text)).await;
        }
    }
}
