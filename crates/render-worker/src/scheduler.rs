// TaskScheduler: the worker's main loop.
//
//   Starting -> Registering -> Idle -> Fetching -> Executing -> Reporting -> Idle
//
// Backoff is entered from Fetching or Reporting after a transient failure and
// returns to the state it came from. ShuttingDown is terminal and reachable
// from every state once the host context's shutdown token is cancelled.
//
// Fetches are only ever started by the loop's own timer. `schedule_fetch`
// just moves the timer's deadline (the earliest request wins), so at most
// one fetch is outstanding and no caller ever performs one synchronously.

use crate::commands::CommandRegistry;
use crate::error::WorkerError;
use crate::error_throttler::ErrorThrottler;
use crate::executor::CommandExecutor;
use crate::identity::WorkerIdentity;
use crate::manager_client::{Credentials, ManagerClient};
use crate::reporter::StatusReporter;
use crate::task::{MayKeepRunning, Task, TaskUpdate};
use render_common::constants::manager_api;
use render_common::{HostContext, ShutdownReason, TaskStatus, Tracing, WorkerSettings};
use render_sdk::TraceWriter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound for the sign-off call on the way out.
const SIGN_OFF_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Starting,
    Registering,
    Idle,
    Fetching,
    Executing,
    Reporting,
    Backoff,
    ShuttingDown,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Starting => "starting",
            SchedulerState::Registering => "registering",
            SchedulerState::Idle => "idle",
            SchedulerState::Fetching => "fetching",
            SchedulerState::Executing => "executing",
            SchedulerState::Reporting => "reporting",
            SchedulerState::Backoff => "backoff",
            SchedulerState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Lets other components watch and steer a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    fetch_tx: mpsc::UnboundedSender<Duration>,
    context: Arc<HostContext>,
    state_rx: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    /// Request a fetch `delay` from now. Returns immediately; the fetch
    /// itself happens on the scheduler's timer.
    pub fn schedule_fetch(&self, delay: Duration) {
        let _ = self.fetch_tx.send(delay);
    }

    /// Stop the worker, cancelling any running task.
    pub fn shutdown(&self) {
        self.context.shutdown(ShutdownReason::UserCancelled);
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state_rx.clone()
    }
}

enum FetchOutcome {
    Task(Box<Task>),
    NoTask,
    Failed(String),
}

pub struct TaskScheduler {
    context: Arc<HostContext>,
    settings: Arc<WorkerSettings>,
    manager: Arc<dyn ManagerClient>,
    identity: WorkerIdentity,
    executor: CommandExecutor,
    throttler: ErrorThrottler,
    trace: Tracing,

    state_tx: watch::Sender<SchedulerState>,
    state_rx: watch::Receiver<SchedulerState>,
    fetch_tx: mpsc::UnboundedSender<Duration>,
    fetch_rx: mpsc::UnboundedReceiver<Duration>,
    next_fetch: Option<Instant>,

    run_once: bool,
}

impl TaskScheduler {
    pub fn new(
        context: Arc<HostContext>,
        settings: Arc<WorkerSettings>,
        manager: Arc<dyn ManagerClient>,
        identity: WorkerIdentity,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SchedulerState::Starting);
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        Self {
            trace: context.get_trace("TaskScheduler"),
            executor: CommandExecutor::new(registry, settings.clone(), context.clone()),
            throttler: ErrorThrottler::from_settings(&settings),
            context,
            settings,
            manager,
            identity,
            state_tx,
            state_rx,
            fetch_tx,
            fetch_rx,
            next_fetch: None,
            run_once: false,
        }
    }

    /// Stop after the first task has been reported.
    pub fn with_run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            fetch_tx: self.fetch_tx.clone(),
            context: self.context.clone(),
            state_rx: self.state_rx.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    /// Arm the fetch timer `delay` from now unless it already fires earlier.
    pub fn schedule_fetch(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        self.next_fetch = Some(match self.next_fetch {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        });
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            self.trace.verbose(&format!("State {previous} -> {state}"));
        }
    }

    /// Run until shutdown. Only a fatal registration failure is an error.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let shutdown = self.context.shutdown_token();

        self.set_state(SchedulerState::Registering);
        let credentials = match self.register(&shutdown).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                self.set_state(SchedulerState::ShuttingDown);
                return Ok(());
            }
            Err(e) => {
                self.trace.error(&format!("Registration failed: {e}"));
                self.set_state(SchedulerState::ShuttingDown);
                return Err(e);
            }
        };

        if let Err(e) = self.identity.sign_on(self.manager.as_ref()).await {
            self.trace.warning(&format!("Sign-on failed: {e}"));
        }

        let mut reporter = StatusReporter::new(
            self.manager.clone(),
            credentials.clone(),
            self.context.secret_masker.clone(),
            &self.settings,
        );

        self.schedule_fetch(Duration::ZERO);
        self.main_loop(&credentials, &mut reporter, &shutdown).await;

        self.set_state(SchedulerState::ShuttingDown);
        self.trace.info(&format!(
            "Shutting down ({})",
            self.context
                .shutdown_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no reason".into())
        ));
        match tokio::time::timeout(SIGN_OFF_TIMEOUT, self.identity.sign_off(self.manager.as_ref()))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.trace.warning(&format!("Sign-off failed: {e}")),
            Err(_) => self.trace.warning("Sign-off timed out"),
        }
        Ok(())
    }

    /// Register unless already registered, retrying transport failures.
    /// `Ok(None)` means shutdown was requested first.
    async fn register(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Credentials>, WorkerError> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                attempt = self.identity.register_if_needed(self.manager.as_ref()) => attempt,
            };

            match attempt {
                Ok(_) => {
                    self.throttler.reset();
                    return self
                        .identity
                        .credentials()
                        .map(Some)
                        .ok_or(WorkerError::NotRegistered);
                }
                Err(e) if e.is_transient() => {
                    self.trace
                        .warning(&format!("Cannot reach manager to register: {e}"));
                    if !self.throttler.increment_and_wait(shutdown).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn main_loop(
        &mut self,
        credentials: &Credentials,
        reporter: &mut StatusReporter,
        shutdown: &CancellationToken,
    ) {
        'main: loop {
            self.set_state(SchedulerState::Idle);
            let deadline = self.next_fetch;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(delay) = self.fetch_rx.recv() => {
                    self.schedule_fetch(delay);
                    continue;
                }
                _ = sleep_until(deadline) => {}
            }
            self.next_fetch = None;

            let task = loop {
                self.set_state(SchedulerState::Fetching);
                let outcome = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'main,
                    outcome = self.fetch_task(credentials) => outcome,
                };

                match outcome {
                    FetchOutcome::Task(task) => {
                        self.throttler.reset();
                        break task;
                    }
                    FetchOutcome::NoTask => {
                        self.throttler.reset();
                        self.trace.verbose("No task available");
                        self.schedule_fetch(self.settings.poll_interval());
                        continue 'main;
                    }
                    FetchOutcome::Failed(reason) => {
                        self.trace.warning(&format!("Fetching a task failed: {reason}"));
                        self.set_state(SchedulerState::Backoff);
                        if !self.throttler.increment_and_wait(shutdown).await {
                            break 'main;
                        }
                    }
                }
            };

            if !self.run_task(*task, credentials, reporter, shutdown).await {
                break;
            }

            if self.run_once {
                self.trace.info("Task done, leaving after one task");
                self.context.shutdown(ShutdownReason::RunOnceCompleted);
                break;
            }
            self.schedule_fetch(self.settings.task_done_delay());
        }
    }

    async fn fetch_task(&self, credentials: &Credentials) -> FetchOutcome {
        let response = match self.manager.get(manager_api::TASK, Some(credentials)).await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Failed(e.to_string()),
        };

        if self.settings.is_no_task_status(response.status)
            || (response.is_success() && response.is_empty())
        {
            return FetchOutcome::NoTask;
        }
        if !response.is_success() {
            return FetchOutcome::Failed(format!(
                "HTTP {}: {}",
                response.status,
                response.body_text()
            ));
        }

        match response.json::<Task>() {
            Ok(task) => FetchOutcome::Task(Box::new(task)),
            Err(e) => FetchOutcome::Failed(format!("cannot decode task: {e}")),
        }
    }

    /// Execute `task` and deliver its terminal status. Returns `false` when
    /// shutdown interrupted delivery.
    async fn run_task(
        &self,
        task: Task,
        credentials: &Credentials,
        reporter: &mut StatusReporter,
        shutdown: &CancellationToken,
    ) -> bool {
        self.set_state(SchedulerState::Executing);
        self.trace.info(&format!(
            "Running task {} ({}) of job {}, type {}",
            task.id, task.name, task.job, task.job_type
        ));
        self.trace.verbose_object(&task);

        let task_cancel = shutdown.child_token();
        let done = CancellationToken::new();
        reporter.bind_task(&task.id, task_cancel.clone());

        let (result, revoked) = tokio::join!(
            async {
                let result = self
                    .executor
                    .execute(&task, reporter, task_cancel.clone())
                    .await;
                done.cancel();
                result
            },
            watch_may_i_run(
                self.manager.as_ref(),
                credentials,
                &task.id,
                self.settings.may_i_run_interval(),
                &task_cancel,
                &done,
            )
        );

        let activity = match revoked {
            Some(reason) if result.status == TaskStatus::Canceled => {
                format!("canceled by manager: {reason}")
            }
            _ => result.activity,
        };

        self.set_state(SchedulerState::Reporting);
        reporter
            .report(&task.id, TaskUpdate::status(result.status).with_activity(activity))
            .await;
        let delivered = self.flush_reports(reporter, shutdown).await;
        reporter.unbind_task();

        if delivered {
            self.trace
                .info(&format!("Task {} reported as {}", task.id, result.status));
        } else {
            self.trace.warning(&format!(
                "Shutting down before task {} was reported",
                task.id
            ));
        }
        delivered
    }

    /// Retry until every queued update is delivered; only shutdown stops it.
    async fn flush_reports(
        &self,
        reporter: &mut StatusReporter,
        shutdown: &CancellationToken,
    ) -> bool {
        while reporter.pending() > 0 {
            if reporter.in_backoff() {
                self.set_state(SchedulerState::Backoff);
                if !reporter.wait_backoff(shutdown).await {
                    return false;
                }
                self.set_state(SchedulerState::Reporting);
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = reporter.try_flush() => {}
            }
        }
        true
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Ask the manager every `interval` whether the task may keep running, and
/// cancel it when the answer is no. Ends once `done` is cancelled.
///
/// Returns the manager's reason when it stopped the task.
async fn watch_may_i_run(
    manager: &dyn ManagerClient,
    credentials: &Credentials,
    task_id: &str,
    interval: Duration,
    task_cancel: &CancellationToken,
    done: &CancellationToken,
) -> Option<String> {
    let path = manager_api::may_i_run(task_id);
    loop {
        tokio::select! {
            _ = done.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }

        let response = tokio::select! {
            _ = done.cancelled() => return None,
            response = manager.get(&path, Some(credentials)) => response,
        };

        match response {
            Ok(response) if response.is_success() => match response.json::<MayKeepRunning>() {
                Ok(answer) if !answer.may_keep_running => {
                    let reason = answer
                        .reason
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "no reason given".into());
                    tracing::warn!("Manager stopped task {}: {}", task_id, reason);
                    task_cancel.cancel();
                    return Some(reason);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Unexpected may-i-run answer: {}", e),
            },
            Ok(response) => tracing::debug!("may-i-run answered HTTP {}", response.status),
            Err(e) => tracing::warn!("may-i-run check failed: {}", e),
        }
    }
}
