// HttpClientFactory: builds the reqwest client used to talk to the manager.

use anyhow::{Context, Result};
use reqwest::Client;
use render_sdk::{StringUtil, WorkerPackage};
use std::time::Duration;

/// Environment variable that disables TLS certificate verification.
pub const TLS_NO_VERIFY_VARIABLE: &str = "RENDER_WORKER_TLS_NO_VERIFY";

/// Creates configured HTTP clients for the worker.
pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Create a client with the given per-request timeout.
    ///
    /// - The user agent is `render-worker/<version>`.
    /// - Proxies come from the standard `HTTP(S)_PROXY` / `NO_PROXY`
    ///   variables, which reqwest reads itself.
    /// - If `RENDER_WORKER_TLS_NO_VERIFY` is true, TLS certificates are not
    ///   verified (dangerous, for self-signed test managers only).
    pub fn create_client(request_timeout: Duration) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(WorkerPackage::user_agent())
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(10)));

        if let Ok(val) = std::env::var(TLS_NO_VERIFY_VARIABLE) {
            if StringUtil::convert_to_bool(&val) == Some(true) {
                tracing::warn!(
                    "{} is set, manager TLS certificates are not verified",
                    TLS_NO_VERIFY_VARIABLE
                );
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder.build().context("Failed to build HTTP client")
    }
}
