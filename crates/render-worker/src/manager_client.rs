// ManagerClient: the narrow HTTP interface the worker uses to talk to the
// manager. Production code uses `HttpManagerClient`; tests substitute a
// scripted fake.

use crate::error::ManagerError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Basic-auth credentials of a registered worker.
///
/// Only a registered `WorkerIdentity` hands these out, so an authenticated
/// request cannot be made before registration.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    worker_id: String,
    secret: String,
}

impl Credentials {
    pub(crate) fn new(worker_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            secret: secret.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("worker_id", &self.worker_id)
            .field("secret", &"***")
            .finish()
    }
}

/// Status code plus decoded JSON body of a manager response.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerResponse {
    pub status: u16,
    /// `None` for an empty body. Non-JSON error bodies are kept as a string.
    pub body: Option<Value>,
}

impl ManagerResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the body is absent or JSON `null`.
    pub fn is_empty(&self) -> bool {
        matches!(self.body, None | Some(Value::Null))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone().unwrap_or(Value::Null))
    }

    /// Body as text, for error messages.
    pub fn body_text(&self) -> String {
        match &self.body {
            None => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// HTTP access to the manager, relative to its base URL.
#[async_trait]
pub trait ManagerClient: Send + Sync {
    async fn get(
        &self,
        path: &str,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError>;

    async fn post(
        &self,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError>;

    async fn put(
        &self,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError>;
}

/// `ManagerClient` over reqwest. Every request is bounded by the client's
/// timeout; a timeout is reported as [`ManagerError::Timeout`].
pub struct HttpManagerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpManagerClient {
    pub fn new(manager_url: &str, request_timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(manager_url)
            .with_context(|| format!("Invalid manager URL '{manager_url}'"))?;
        let client = render_common::HttpClientFactory::create_client(request_timeout)?;
        Ok(Self::with_client(parsed.as_str(), client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Absolute URL for `path`, keeping any path prefix of the base URL.
    pub fn url_for(&self, path: &str) -> Result<url::Url, ManagerError> {
        let joined = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        url::Url::parse(&joined).map_err(|e| ManagerError::InvalidUrl {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        let method_name = method_name(&method);
        let url = self.url_for(path)?;

        let mut request = self.client.request(method, url);
        if let Some(credentials) = auth {
            request = request.basic_auth(credentials.worker_id(), Some(credentials.secret()));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let transport_error = |e: reqwest::Error| {
            if e.is_timeout() {
                ManagerError::Timeout {
                    method: method_name,
                    path: path.to_string(),
                }
            } else {
                ManagerError::Transport {
                    method: method_name,
                    path: path.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(transport_error)?;

        tracing::debug!("{} {} -> {} ({} bytes)", method_name, path, status, bytes.len());

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(ManagerResponse::new(status, None));
        }

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Ok(ManagerResponse::new(status, Some(value))),
            Err(_) if !(200..300).contains(&status) => Ok(ManagerResponse::new(
                status,
                Some(Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            )),
            Err(e) => Err(ManagerError::Decode {
                method: method_name,
                path: path.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn method_name(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        _ => "OTHER",
    }
}

#[async_trait]
impl ManagerClient for HttpManagerClient {
    async fn get(
        &self,
        path: &str,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.send(Method::GET, path, None, auth).await
    }

    async fn post(
        &self,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.send(Method::POST, path, body, auth).await
    }

    async fn put(
        &self,
        path: &str,
        body: Option<&Value>,
        auth: Option<&Credentials>,
    ) -> Result<ManagerResponse, ManagerError> {
        self.send(Method::PUT, path, body, auth).await
    }
}
