// Per-component trace sources. Every message is masked with the shared
// SecretMasker before it reaches the `tracing` subscriber.

use crate::secret_masker::SecretMasker;
use render_sdk::TraceWriter;
use std::sync::Arc;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// Configuration for trace output.
#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity level to emit.
    pub level: TraceEventType,
    /// Also print every line to stdout, bypassing the subscriber's filter.
    pub print_to_stdout: bool,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
            print_to_stdout: false,
        }
    }
}

/// A named trace source. Cheap to clone; all clones share one masker.
#[derive(Clone)]
pub struct Tracing {
    name: String,
    secret_masker: Arc<SecretMasker>,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(
        name: impl Into<String>,
        secret_masker: Arc<SecretMasker>,
        setting: TraceSetting,
    ) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            setting,
        }
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let masked = self.secret_masker.mask_secrets(message);
        let component = self.name.as_str();

        match event_type {
            TraceEventType::Error => tracing::error!(component, "{}", masked),
            TraceEventType::Warning => tracing::warn!(component, "{}", masked),
            TraceEventType::Information => tracing::info!(component, "{}", masked),
            TraceEventType::Verbose => tracing::debug!(component, "{}", masked),
        }

        if self.setting.print_to_stdout {
            println!(
                "[{}][{}] {}: {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                component,
                event_type,
                masked
            );
        }
    }

    /// Get the name of this trace source.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log a serialized object as verbose JSON.
    pub fn verbose_object<T: serde::Serialize>(&self, item: &T) {
        match serde_json::to_string(item) {
            Ok(json) => self.verbose(&json),
            Err(e) => self.verbose(&format!("<serialization error: {}>", e)),
        }
    }

    /// Log an error with its whole cause chain.
    pub fn error_chain(&self, err: &anyhow::Error) {
        self.error(&format!("{err}"));
        for cause in err.chain().skip(1) {
            self.error(&format!("  caused by: {cause}"));
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named trace sources sharing one `SecretMasker`.
pub struct TraceManager {
    secret_masker: Arc<SecretMasker>,
    default_setting: TraceSetting,
}

impl TraceManager {
    pub fn new(secret_masker: Arc<SecretMasker>) -> Self {
        Self::with_setting(secret_masker, TraceSetting::default())
    }

    pub fn with_setting(secret_masker: Arc<SecretMasker>, setting: TraceSetting) -> Self {
        Self {
            secret_masker,
            default_setting: setting,
        }
    }

    /// Get (create) a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone(), self.default_setting.clone())
    }

    pub fn secret_masker(&self) -> &Arc<SecretMasker> {
        &self.secret_masker
    }
}
