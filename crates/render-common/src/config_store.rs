// ConfigurationStore: loads and saves the worker settings and credentials.
//
// Settings are read from `.worker`, merged key-by-key with the optional
// `.worker.override`, then environment overrides are applied on top.

use crate::constants::{self, WellKnownConfigFile};
use crate::credential_data::WorkerCredentials;
use crate::host_context::HostContext;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use render_sdk::StringUtil;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// WorkerSettings
// ---------------------------------------------------------------------------

/// Persisted worker configuration. Every field has a default, so a partial
/// `.worker` file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Base URL of the manager, e.g. `http://manager.local:8083/`.
    pub manager_url: String,

    /// Job types this worker accepts tasks for.
    pub supported_job_types: Vec<String>,

    /// Name shown on the manager. Defaults to the host name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    /// Delay before the next fetch after the manager had no task for us.
    pub poll_interval_secs: f64,

    /// Delay before the next fetch after a task was reported.
    pub task_done_delay_secs: f64,

    /// How often the manager is asked whether the running task may continue.
    pub may_i_run_interval_secs: f64,

    /// How often buffered command output is pushed to the manager.
    pub log_flush_interval_secs: f64,

    /// First retry delay after a transient manager failure.
    pub backoff_base_secs: f64,

    /// Retry delays never grow past this value.
    pub backoff_ceiling_secs: f64,

    /// Timeout applied to every manager request.
    pub request_timeout_secs: f64,

    /// HTTP status codes of `GET /task` that mean "no task available".
    pub no_task_status_codes: Vec<u16>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            manager_url: String::new(),
            supported_job_types: vec!["sleep".to_string(), "blender-render".to_string()],
            nickname: None,
            poll_interval_secs: 5.0,
            task_done_delay_secs: 1.0,
            may_i_run_interval_secs: 5.0,
            log_flush_interval_secs: 5.0,
            backoff_base_secs: 1.0,
            backoff_ceiling_secs: 60.0,
            request_timeout_secs: 30.0,
            no_task_status_codes: vec![204],
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn task_done_delay(&self) -> Duration {
        secs(self.task_done_delay_secs)
    }

    pub fn may_i_run_interval(&self) -> Duration {
        secs(self.may_i_run_interval_secs)
    }

    pub fn log_flush_interval(&self) -> Duration {
        secs(self.log_flush_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        secs(self.backoff_base_secs)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        secs(self.backoff_ceiling_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    /// The nickname, falling back to the host name.
    pub fn effective_nickname(&self) -> String {
        match &self.nickname {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "render-worker".to_string()),
        }
    }

    pub fn is_no_task_status(&self, status: u16) -> bool {
        self.no_task_status_codes.contains(&status)
    }

    /// Check that the settings can drive a worker.
    pub fn validate(&self) -> Result<()> {
        if self.manager_url.trim().is_empty() {
            anyhow::bail!(
                "manager_url is not configured; set it in {} or via {}",
                constants::path::WORKER_SETTINGS_FILE,
                constants::env::MANAGER_URL
            );
        }
        let url = url::Url::parse(&self.manager_url)
            .with_context(|| format!("Invalid manager_url '{}'", self.manager_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("manager_url must use http or https, got '{}'", url.scheme());
        }

        if self.supported_job_types.is_empty() {
            anyhow::bail!("supported_job_types must list at least one job type");
        }

        let durations = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("task_done_delay_secs", self.task_done_delay_secs),
            ("may_i_run_interval_secs", self.may_i_run_interval_secs),
            ("log_flush_interval_secs", self.log_flush_interval_secs),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_ceiling_secs", self.backoff_ceiling_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in durations {
            if Duration::try_from_secs_f64(value).is_err() {
                anyhow::bail!("{name} must be a non-negative number of seconds, got {value}");
            }
        }
        if self.backoff_ceiling_secs < self.backoff_base_secs {
            anyhow::bail!("backoff_ceiling_secs must not be smaller than backoff_base_secs");
        }
        if self.request_timeout_secs <= 0.0 {
            anyhow::bail!("request_timeout_secs must be positive");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge `overlay` into `base`. Objects merge key-by-key recursively; any
/// other value in `overlay` replaces the one in `base`.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply the `RENDER_WORKER_*` environment overrides, looked up via `lookup`.
pub fn apply_env_overrides<F>(settings: &mut Value, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut overrides = Map::new();

    if let Some(url) = lookup(constants::env::MANAGER_URL).filter(|v| !v.trim().is_empty()) {
        overrides.insert("manager_url".into(), Value::String(url.trim().to_string()));
    }

    if let Some(types) = lookup(constants::env::JOB_TYPES) {
        let types = StringUtil::split_list(&types);
        if !types.is_empty() {
            overrides.insert(
                "supported_job_types".into(),
                Value::Array(types.into_iter().map(Value::String).collect()),
            );
        }
    }

    if let Some(nickname) = lookup(constants::env::NICKNAME).filter(|v| !v.trim().is_empty()) {
        overrides.insert("nickname".into(), Value::String(nickname.trim().to_string()));
    }

    merge_json(settings, Value::Object(overrides));
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Loads and saves the worker's on-disk configuration.
pub struct ConfigurationStore {
    config_file_path: PathBuf,
    override_file_path: PathBuf,
    cred_file_path: PathBuf,

    creds: Mutex<Option<WorkerCredentials>>,
}

impl ConfigurationStore {
    pub fn new(context: &HostContext) -> Self {
        Self {
            config_file_path: context.get_config_file(WellKnownConfigFile::Worker),
            override_file_path: context.get_config_file(WellKnownConfigFile::WorkerOverride),
            cred_file_path: context.get_config_file(WellKnownConfigFile::Credentials),
            creds: Mutex::new(None),
        }
    }

    /// Whether a `.worker` settings file exists.
    pub fn is_configured(&self) -> bool {
        self.config_file_path.exists()
    }

    /// Load settings with overrides from the process environment.
    pub fn load_settings(&self) -> Result<WorkerSettings> {
        self.load_settings_with_env(|key| std::env::var(key).ok())
    }

    /// Load settings, taking environment overrides from `lookup`.
    ///
    /// A missing `.worker` file is not an error: defaults plus overrides are
    /// used. The result is not validated.
    pub fn load_settings_with_env<F>(&self, lookup: F) -> Result<WorkerSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = serde_json::to_value(WorkerSettings::default())
            .context("Failed to serialize default worker settings")?;

        if let Some(base) = read_json_object(&self.config_file_path)? {
            merge_json(&mut merged, base);
        }
        if let Some(overlay) = read_json_object(&self.override_file_path)? {
            tracing::debug!("Applying settings override from {:?}", self.override_file_path);
            merge_json(&mut merged, overlay);
        }
        apply_env_overrides(&mut merged, lookup);

        serde_json::from_value(merged).context("Failed to deserialize worker settings")
    }

    /// Load the stored credentials, or `None` when none were saved yet.
    /// Cached after the first successful load.
    pub fn get_credentials(&self) -> Result<Option<WorkerCredentials>> {
        let mut guard = self.creds.lock();
        if let Some(ref creds) = *guard {
            return Ok(Some(creds.clone()));
        }

        if !self.cred_file_path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.cred_file_path)
            .with_context(|| format!("Failed to read credentials from {:?}", self.cred_file_path))?;
        let creds: WorkerCredentials =
            serde_json::from_str(&json).context("Failed to deserialize worker credentials")?;

        *guard = Some(creds.clone());
        Ok(Some(creds))
    }

    /// Save credentials to `.credentials`, restricted to the owner on Unix.
    pub fn save_credentials(&self, credentials: &WorkerCredentials) -> Result<()> {
        let json = serde_json::to_string_pretty(credentials)?;
        fs::write(&self.cred_file_path, json).with_context(|| {
            format!("Failed to write credentials to {:?}", self.cred_file_path)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.cred_file_path, fs::Permissions::from_mode(0o600))
                .with_context(|| {
                    format!("Failed to restrict permissions of {:?}", self.cred_file_path)
                })?;
        }

        *self.creds.lock() = Some(credentials.clone());
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    if json.trim().is_empty() {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {:?}", path))?;
    if !value.is_object() {
        anyhow::bail!("{:?} must contain a JSON object", path);
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn store_in(dir: &Path) -> ConfigurationStore {
        let context = HostContext::new(dir);
        ConfigurationStore::new(&context)
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(!store.is_configured());

        let settings = store.load_settings_with_env(env(&[])).unwrap();
        assert_eq!(settings, WorkerSettings::default());
        assert_eq!(settings.task_done_delay(), Duration::from_secs(1));
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert!(settings.is_no_task_status(204));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_override_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".worker"),
            json!({
                "manager_url": "http://manager:8083/",
                "supported_job_types": ["sleep"],
                "poll_interval_secs": 10.0
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join(".worker.override"),
            json!({ "poll_interval_secs": 2.5 }).to_string(),
        )
        .unwrap();

        let store = store_in(dir.path());
        let settings = store.load_settings_with_env(env(&[])).unwrap();
        assert_eq!(settings.manager_url, "http://manager:8083/");
        assert_eq!(settings.supported_job_types, vec!["sleep"]);
        assert_eq!(settings.poll_interval(), Duration::from_millis(2500));
        settings.validate().unwrap();
    }

    #[test]
    fn test_env_wins_over_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".worker"),
            json!({ "manager_url": "http://from-file/" }).to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join(".worker.override"),
            json!({ "manager_url": "http://from-override/" }).to_string(),
        )
        .unwrap();

        let store = store_in(dir.path());
        let settings = store
            .load_settings_with_env(env(&[
                (constants::env::MANAGER_URL, "http://from-env/"),
                (constants::env::JOB_TYPES, "blender-render, sleep"),
                (constants::env::NICKNAME, "render-07"),
            ]))
            .unwrap();
        assert_eq!(settings.manager_url, "http://from-env/");
        assert_eq!(settings.supported_job_types, vec!["blender-render", "sleep"]);
        assert_eq!(settings.effective_nickname(), "render-07");
    }

    #[test]
    fn test_invalid_override_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".worker.override"), "[1, 2]").unwrap();
        let store = store_in(dir.path());
        assert!(store.load_settings_with_env(env(&[])).is_err());
    }

    #[test]
    fn test_merge_json_recurses() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": [1]});
        merge_json(&mut base, json!({"a": {"y": 3}, "b": [2, 3]}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "b": [2, 3]}));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = WorkerSettings {
            manager_url: "http://manager/".into(),
            ..WorkerSettings::default()
        };
        settings.validate().unwrap();

        settings.backoff_ceiling_secs = 0.5;
        assert!(settings.validate().is_err());

        settings.backoff_ceiling_secs = 60.0;
        settings.poll_interval_secs = -1.0;
        assert!(settings.validate().is_err());

        settings.poll_interval_secs = 1.0;
        settings.manager_url = "ftp://manager/".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_credentials_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.get_credentials().unwrap().is_none());

        let creds = WorkerCredentials {
            worker_id: Some("5555".into()),
            worker_secret: "jemoeder".into(),
        };
        store.save_credentials(&creds).unwrap();

        let fresh = store_in(dir.path());
        assert_eq!(fresh.get_credentials().unwrap(), Some(creds));
    }
}
