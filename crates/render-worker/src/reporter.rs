// StatusReporter: delivers task status updates to the manager.
//
// Updates are queued and leave the queue strictly in FIFO order through a
// single in-flight slot. A failed delivery keeps the update at the head of the
// queue and opens a backoff window; newer updates queue behind it until the
// retry succeeds. Nothing is dropped except updates for a task the manager
// has taken away from this worker (HTTP 409).

use crate::error_throttler::ErrorThrottler;
use crate::manager_client::{Credentials, ManagerClient};
use crate::task::TaskUpdate;
use render_common::constants::manager_api;
use render_common::{SecretMasker, WorkerSettings};
use render_sdk::StringUtil;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Status the manager answers with when the task belongs to another worker.
const HTTP_CONFLICT: u16 = 409;

/// Longest response body excerpt written to the log.
const MAX_BODY_IN_LOG: usize = 200;

#[derive(Debug, Clone)]
struct QueuedUpdate {
    task_id: String,
    sequence: u64,
    update: TaskUpdate,
}

pub struct StatusReporter {
    manager: Arc<dyn ManagerClient>,
    credentials: Credentials,
    secret_masker: Arc<SecretMasker>,
    throttler: ErrorThrottler,

    queue: VecDeque<QueuedUpdate>,
    next_sequence: u64,
    /// No delivery is attempted before this instant.
    retry_after: Option<Instant>,

    /// The running task and the token that cancels it.
    bound: Option<(String, CancellationToken)>,
    /// Task the manager reassigned; its updates are discarded.
    revoked: Option<String>,
}

impl StatusReporter {
    pub fn new(
        manager: Arc<dyn ManagerClient>,
        credentials: Credentials,
        secret_masker: Arc<SecretMasker>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            manager,
            credentials,
            secret_masker,
            throttler: ErrorThrottler::from_settings(settings),
            queue: VecDeque::new(),
            next_sequence: 0,
            retry_after: None,
            bound: None,
            revoked: None,
        }
    }

    /// Associate the running task with its cancellation token, so a 409 on
    /// one of its updates can stop it.
    pub fn bind_task(&mut self, task_id: &str, cancel: CancellationToken) {
        if self.revoked.as_deref() != Some(task_id) {
            self.revoked = None;
        }
        self.bound = Some((task_id.to_string(), cancel));
    }

    pub fn unbind_task(&mut self) {
        self.bound = None;
    }

    /// Whether the manager took `task_id` away from this worker.
    pub fn is_revoked(&self, task_id: &str) -> bool {
        self.revoked.as_deref() == Some(task_id)
    }

    /// Number of updates waiting for delivery.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether a failed delivery's backoff window is still open.
    pub fn in_backoff(&self) -> bool {
        self.retry_after.is_some_and(|at| Instant::now() < at)
    }

    /// Queue an update for `task_id` and try to deliver the queue, unless a
    /// backoff window is open.
    pub async fn report(&mut self, task_id: &str, update: TaskUpdate) {
        if self.is_revoked(task_id) {
            tracing::debug!("Dropping update for revoked task {}", task_id);
            return;
        }

        let update = TaskUpdate {
            status: update.status,
            activity: update.activity.map(|a| self.secret_masker.mask_secrets(&a)),
            log: update.log.map(|l| self.secret_masker.mask_secrets(&l)),
        };

        self.next_sequence += 1;
        self.queue.push_back(QueuedUpdate {
            task_id: task_id.to_string(),
            sequence: self.next_sequence,
            update,
        });

        if !self.in_backoff() {
            self.try_flush().await;
        }
    }

    /// Deliver queued updates head first until the queue is empty or a
    /// delivery fails. Returns `true` once the queue is empty.
    pub async fn try_flush(&mut self) -> bool {
        while let Some(head) = self.queue.front() {
            let task_id = head.task_id.clone();
            let sequence = head.sequence;
            let path = manager_api::task_status(&task_id);
            let body = match serde_json::to_value(&head.update) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("Cannot encode update #{} for task {}: {}", sequence, task_id, e);
                    self.queue.pop_front();
                    continue;
                }
            };

            match self
                .manager
                .post(&path, Some(&body), Some(&self.credentials))
                .await
            {
                Ok(response) if response.is_success() => {
                    tracing::debug!("Delivered update #{} for task {}", sequence, task_id);
                    self.queue.pop_front();
                    self.throttler.reset();
                    self.retry_after = None;
                }
                Ok(response) if response.status == HTTP_CONFLICT => {
                    tracing::warn!(
                        "Manager says task {} is no longer ours: {}",
                        task_id,
                        StringUtil::substring_prefix(&response.body_text(), MAX_BODY_IN_LOG)
                    );
                    self.revoke(&task_id);
                }
                Ok(response) => {
                    self.delay_retry(
                        &task_id,
                        &format!(
                            "HTTP {}: {}",
                            response.status,
                            StringUtil::substring_prefix(&response.body_text(), MAX_BODY_IN_LOG)
                        ),
                    );
                    return false;
                }
                Err(e) => {
                    self.delay_retry(&task_id, &e.to_string());
                    return false;
                }
            }
        }
        true
    }

    /// Sleep until the backoff window closes. Returns `false` if cancelled.
    pub async fn wait_backoff(&self, cancel: &CancellationToken) -> bool {
        let Some(at) = self.retry_after else {
            return true;
        };
        tokio::select! {
            _ = tokio::time::sleep_until(at) => true,
            _ = cancel.cancelled() => false,
        }
    }

    fn delay_retry(&mut self, task_id: &str, reason: &str) {
        let delay = self.throttler.next_delay();
        tracing::warn!(
            "Failed to deliver update for task {} ({}), retrying in {:.1}s with {} update(s) queued",
            task_id,
            reason,
            delay.as_secs_f64(),
            self.queue.len()
        );
        self.retry_after = Some(Instant::now() + delay);
    }

    fn revoke(&mut self, task_id: &str) {
        self.queue.retain(|queued| queued.task_id != task_id);
        self.revoked = Some(task_id.to_string());
        if let Some((bound_id, cancel)) = &self.bound {
            if bound_id == task_id {
                cancel.cancel();
            }
        }
    }
}
