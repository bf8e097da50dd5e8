// Scripted manager and fixtures shared by the unit tests.

use crate::error::ManagerError;
use crate::manager_client::{Credentials, ManagerClient, ManagerResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use render_common::{HostContext, WorkerSettings};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Respond(u16, Option<Value>),
    Fail(String),
    /// A 2xx reply whose body is not JSON.
    Garbled(String),
    /// `200` after a delay.
    Stall(Duration),
}

/// One request seen by the fake.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
    pub auth: Option<(String, String)>,
    pub at: Instant,
}

/// A `ManagerClient` answering from per-route scripts.
///
/// Each route pops its scripted responses in order; the last one repeats.
/// Unscripted routes answer `200` with an empty body.
#[derive(Default)]
pub(crate) struct FakeManager {
    routes: Mutex<HashMap<(&'static str, String), VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &'static str, path: &str, status: u16, body: Option<Value>) {
        self.script(method, path, Scripted::Respond(status, body));
    }

    pub fn fail(&self, method: &'static str, path: &str, message: &str) {
        self.script(method, path, Scripted::Fail(message.to_string()));
    }

    pub fn stall(&self, method: &'static str, path: &str, delay: Duration) {
        self.script(method, path, Scripted::Stall(delay));
    }

    pub fn garble(&self, method: &'static str, path: &str, body: &str) {
        self.script(method, path, Scripted::Garbled(body.to_string()));
    }

    fn script(&self, method: &'static str, path: &str, response: Scripted) {
        self.routes
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str, path: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .cloned()
            .collect()
    }

    async fn answer(
        &self,
        method: &'static str,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.calls.lock().push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
            auth: auth.map(|c| (c.worker_id().to_string(), c.secret().to_string())),
            at: Instant::now(),
        });

        let scripted = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&(method, path.to_string())) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match scripted {
            None => Ok(ManagerResponse::new(200, None)),
            Some(Scripted::Respond(status, body)) => Ok(ManagerResponse::new(status, body)),
            Some(Scripted::Fail(message)) => Err(ManagerError::Transport {
                method,
                path: path.to_string(),
                message,
            }),
            Some(Scripted::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(ManagerResponse::new(200, None))
            }
            Some(Scripted::Garbled(body)) => Err(ManagerError::Decode {
                method,
                path: path.to_string(),
                message: format!("expected value at line 1 column 1 in {body:?}"),
            }),
        }
    }
}

#[async_trait]
impl ManagerClient for FakeManager {
    async fn get(
        &self,
        path: &str,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.answer("GET", path, None, auth).await
    }

    async fn post(
        &self,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.answer("POST", path, body, auth).await
    }

    async fn put(
        &self,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.answer("PUT", path, body, auth).await
    }
}

/// Settings tuned for tests: short intervals, supports `sleep` and `unittest`.
pub(crate) fn test_settings() -> WorkerSettings {
    WorkerSettings {
        manager_url: "http://manager.test/".into(),
        supported_job_types: vec!["sleep".into(), "unittest".into()],
        nickname: Some("test-worker".into()),
        poll_interval_secs: 5.0,
        task_done_delay_secs: 1.0,
        may_i_run_interval_secs: 1.0,
        log_flush_interval_secs: 1.0,
        backoff_base_secs: 1.0,
        backoff_ceiling_secs: 8.0,
        request_timeout_secs: 30.0,
        no_task_status_codes: vec![204],
    }
}

/// A host context rooted in a fresh temporary directory.
pub(crate) fn test_context() -> (tempfile::TempDir, Arc<HostContext>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let context = HostContext::new(dir.path());
    (dir, context)
}

pub(crate) fn test_credentials() -> Credentials {
    Credentials::new("1234", "jemoeder")
}
