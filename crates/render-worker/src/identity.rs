// WorkerIdentity: the worker's id, secret and capabilities, plus the
// registration, sign-on and sign-off handshakes with the manager.

use crate::error::{ManagerError, WorkerError};
use crate::manager_client::{Credentials, ManagerClient};
use anyhow::Context;
use render_common::constants::manager_api;
use render_common::{
    ConfigurationStore, OsPlatform, WorkerCredentials, WorkerSettings, CURRENT_PLATFORM,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// The platform reported on registration, fixed at compile time.
pub fn detect_platform() -> OsPlatform {
    CURRENT_PLATFORM
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    #[serde(rename = "_id", default)]
    id: Option<String>,
}

/// Who this worker is, as far as the manager is concerned.
pub struct WorkerIdentity {
    credentials: WorkerCredentials,
    supported_job_types: Vec<String>,
    nickname: String,
    platform: OsPlatform,
    store: Option<Arc<ConfigurationStore>>,
}

impl WorkerIdentity {
    pub fn new(credentials: WorkerCredentials, settings: &WorkerSettings) -> Self {
        Self {
            credentials,
            supported_job_types: settings.supported_job_types.clone(),
            nickname: settings.effective_nickname(),
            platform: detect_platform(),
            store: None,
        }
    }

    /// Load the persisted credentials, generating and saving a fresh secret
    /// on first start. Registration updates go to the same store.
    pub fn load_or_create(
        store: Arc<ConfigurationStore>,
        settings: &WorkerSettings,
    ) -> anyhow::Result<Self> {
        let credentials = match store.get_credentials()? {
            Some(credentials) if !credentials.worker_secret.is_empty() => credentials,
            stored => {
                // A new secret invalidates any id registered with the old one.
                if stored.is_some_and(|c| c.worker_id.is_some()) {
                    tracing::warn!("Stored credentials have no secret, registering again");
                }
                let credentials = WorkerCredentials::generate();
                store
                    .save_credentials(&credentials)
                    .context("Failed to persist generated worker secret")?;
                credentials
            }
        };

        let mut identity = Self::new(credentials, settings);
        identity.store = Some(store);
        Ok(identity)
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.credentials
            .worker_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    pub fn secret(&self) -> &str {
        &self.credentials.worker_secret
    }

    pub fn supported_job_types(&self) -> &[String] {
        &self.supported_job_types
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn is_registered(&self) -> bool {
        self.worker_id().is_some()
    }

    /// Basic-auth credentials, available only once registered.
    pub fn credentials(&self) -> Option<Credentials> {
        self.worker_id()
            .map(|id| Credentials::new(id, self.credentials.worker_secret.clone()))
    }

    /// Register with the manager unless a worker id is already known.
    ///
    /// Returns `Ok(true)` when a registration call was made. A non-2xx answer
    /// is [`WorkerError::RegistrationRejected`]; a transport failure is
    /// [`WorkerError::Manager`] and may be retried.
    pub async fn register_if_needed(
        &mut self,
        manager: &dyn ManagerClient,
    ) -> Result<bool, WorkerError> {
        if self.is_registered() {
            tracing::debug!("Already registered as worker {:?}", self.worker_id());
            return Ok(false);
        }

        tracing::info!(
            "Registering at manager as platform {} with job types {:?}",
            self.platform,
            self.supported_job_types
        );

        let payload = json!({
            "platform": self.platform.as_str(),
            "supported_job_types": self.supported_job_types,
            "secret": self.credentials.worker_secret,
            "nickname": self.nickname,
        });

        let response = match manager
            .post(manager_api::REGISTER_WORKER, Some(&payload), None)
            .await
        {
            Ok(response) => response,
            Err(ManagerError::Decode { message, .. }) => {
                return Err(WorkerError::InvalidRegistrationResponse(message));
            }
            Err(e) => return Err(e.into()),
        };

        if !response.is_success() {
            return Err(WorkerError::RegistrationRejected {
                status: response.status,
                body: response.body_text(),
            });
        }

        let worker_id = response
            .json::<RegistrationResponse>()
            .ok()
            .and_then(|r| r.id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| WorkerError::InvalidRegistrationResponse(response.body_text()))?;

        tracing::info!("Registered at manager as worker {}", worker_id);
        self.credentials.worker_id = Some(worker_id);

        if let Some(store) = &self.store {
            if let Err(e) = store.save_credentials(&self.credentials) {
                tracing::warn!(
                    "Registered, but failed to persist credentials; the next start registers again: {:#}",
                    e
                );
            }
        }

        Ok(true)
    }

    /// Tell the manager this worker is online. Best effort.
    pub async fn sign_on(&self, manager: &dyn ManagerClient) -> Result<(), ManagerError> {
        let Some(credentials) = self.credentials() else {
            return Ok(());
        };
        let payload = json!({
            "supported_job_types": self.supported_job_types,
            "nickname": self.nickname,
        });

        let response = manager
            .post(manager_api::SIGN_ON, Some(&payload), Some(&credentials))
            .await?;
        if response.is_success() {
            tracing::info!("Signed on at manager as {}", self.nickname);
        } else {
            tracing::warn!(
                "Manager refused sign-on with HTTP {}: {}",
                response.status,
                response.body_text()
            );
        }
        Ok(())
    }

    /// Tell the manager this worker is going away, so it can re-queue our
    /// task. Best effort.
    pub async fn sign_off(&self, manager: &dyn ManagerClient) -> Result<(), ManagerError> {
        let Some(credentials) = self.credentials() else {
            return Ok(());
        };

        let response = manager
            .post(manager_api::SIGN_OFF, None, Some(&credentials))
            .await?;
        if response.is_success() {
            tracing::info!("Signed off at manager");
        } else {
            tracing::warn!("Manager refused sign-off with HTTP {}", response.status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, test_settings, FakeManager};
    use serde_json::json;

    fn identity(worker_id: Option<&str>) -> WorkerIdentity {
        WorkerIdentity::new(
            WorkerCredentials {
                worker_id: worker_id.map(str::to_string),
                worker_secret: "jemoeder".into(),
            },
            &test_settings(),
        )
    }

    #[tokio::test]
    async fn test_startup_already_registered() {
        let manager = FakeManager::new();
        let mut identity = identity(Some("1234"));

        assert!(!identity.register_if_needed(manager.as_ref()).await.unwrap());
        assert!(manager.calls().is_empty());
    }

    #[tokio::test]
    async fn test_startup_registration() {
        let manager = FakeManager::new();
        manager.respond("POST", "/register-worker", 200, Some(json!({"_id": "5555"})));
        let mut identity = identity(None);
        assert!(identity.credentials().is_none());

        assert!(identity.register_if_needed(manager.as_ref()).await.unwrap());

        let calls = manager.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "POST");
        assert_eq!(calls[0].path, "/register-worker");
        assert!(calls[0].auth.is_none());
        let body = calls[0].body.clone().unwrap();
        assert_eq!(body["platform"], json!(detect_platform().as_str()));
        assert_eq!(body["supported_job_types"], json!(["sleep", "unittest"]));
        assert_eq!(body["secret"], json!("jemoeder"));

        assert_eq!(identity.worker_id(), Some("5555"));
        let creds = identity.credentials().unwrap();
        assert_eq!(creds.worker_id(), "5555");
        assert_eq!(creds.secret(), "jemoeder");
    }

    #[tokio::test]
    async fn test_startup_registration_unhappy() {
        let manager = FakeManager::new();
        manager.respond("POST", "/register-worker", 500, Some(json!({"_id": "5555"})));
        let mut identity = identity(None);

        let err = identity
            .register_if_needed(manager.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::RegistrationRejected { status: 500, .. }
        ));
        assert!(!err.is_transient());
        assert_eq!(manager.calls().len(), 1);
        assert!(!identity.is_registered());
    }

    #[tokio::test]
    async fn test_registration_without_id_is_fatal() {
        let manager = FakeManager::new();
        manager.respond("POST", "/register-worker", 200, Some(json!({"status": "ok"})));
        let mut identity = identity(None);

        let err = identity
            .register_if_needed(manager.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidRegistrationResponse(_)));
    }

    #[tokio::test]
    async fn test_registration_with_non_json_reply_is_fatal() {
        let manager = FakeManager::new();
        manager.garble("POST", "/register-worker", "ok");
        let mut identity = identity(None);

        let err = identity
            .register_if_needed(manager.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidRegistrationResponse(_)));
        assert!(!err.is_transient());
        assert!(!identity.is_registered());
    }

    #[tokio::test]
    async fn test_registration_transport_error_is_transient() {
        let manager = FakeManager::new();
        manager.fail("POST", "/register-worker", "connection refused");
        let mut identity = identity(None);

        let err = identity
            .register_if_needed(manager.as_ref())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_registration_is_persisted() {
        let (_dir, context) = test_context();
        let store = Arc::new(ConfigurationStore::new(&context));
        let manager = FakeManager::new();
        manager.respond("POST", "/register-worker", 201, Some(json!({"_id": "5555"})));

        let mut first = WorkerIdentity::load_or_create(store.clone(), &test_settings()).unwrap();
        let secret = first.secret().to_string();
        assert_eq!(secret.len(), 32);
        first.register_if_needed(manager.as_ref()).await.unwrap();

        // A restart reuses id and secret and makes no call.
        let fresh_store = Arc::new(ConfigurationStore::new(&context));
        let mut second = WorkerIdentity::load_or_create(fresh_store, &test_settings()).unwrap();
        assert_eq!(second.worker_id(), Some("5555"));
        assert_eq!(second.secret(), secret);
        assert!(!second.register_if_needed(manager.as_ref()).await.unwrap());
        assert_eq!(manager.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_sign_on_and_off_use_credentials() {
        let manager = FakeManager::new();
        let identity = identity(Some("1234"));

        identity.sign_on(manager.as_ref()).await.unwrap();
        identity.sign_off(manager.as_ref()).await.unwrap();

        let calls = manager.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].path, "/sign-on");
        assert_eq!(calls[0].body.as_ref().unwrap()["nickname"], json!("test-worker"));
        assert_eq!(calls[1].path, "/sign-off");
        for call in calls {
            assert_eq!(call.auth, Some(("1234".into(), "jemoeder".into())));
        }
    }

    #[tokio::test]
    async fn test_sign_on_skipped_when_unregistered() {
        let manager = FakeManager::new();
        identity(None).sign_on(manager.as_ref()).await.unwrap();
        assert!(manager.calls().is_empty());
    }
}
