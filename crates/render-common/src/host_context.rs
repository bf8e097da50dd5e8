// HostContext: the worker's application context.
// Resolves directories and config files below the worker root, hands out
// component trace sources and coordinates shutdown.

use crate::constants::{self, WellKnownConfigFile, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use parking_lot::Mutex;
use render_sdk::StringUtil;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why the worker is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C or an explicit stop request.
    UserCancelled,
    /// SIGTERM from the service manager or the OS.
    OperatingSystemShutdown,
    /// `--once` finished its single task.
    RunOnceCompleted,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
            ShutdownReason::RunOnceCompleted => write!(f, "RunOnceCompleted"),
        }
    }
}

/// The central application context shared by every worker component.
pub struct HostContext {
    root: PathBuf,

    /// Cancelled once the worker starts shutting down.
    shutdown_token: CancellationToken,

    shutdown_reason: Mutex<Option<ShutdownReason>>,

    /// Secret masker shared across the entire worker process.
    pub secret_masker: Arc<SecretMasker>,

    trace_manager: TraceManager,
}

impl HostContext {
    /// Create a context rooted at `root`, where `.worker`, `.credentials`
    /// and the `_diag` folder live.
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        let secret_masker = Arc::new(SecretMasker::new());

        let print_to_stdout = env::var(constants::env::PRINT_TRACE_TO_STDOUT)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        let trace_setting = TraceSetting {
            print_to_stdout,
            ..TraceSetting::default()
        };
        let trace_manager = TraceManager::with_setting(secret_masker.clone(), trace_setting);

        Arc::new(Self {
            root: root.into(),
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
            secret_masker,
            trace_manager,
        })
    }

    // -----------------------------------------------------------------------
    // Directory resolution
    // -----------------------------------------------------------------------

    /// Resolve the path for a well-known directory.
    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Root => self.root.clone(),
            WellKnownDirectory::Diag => self.root.join(constants::path::DIAG_DIRECTORY),
            WellKnownDirectory::TaskLogs => self
                .get_directory(WellKnownDirectory::Diag)
                .join(constants::path::TASK_LOG_DIRECTORY),
            WellKnownDirectory::Work => self.root.join(constants::path::WORK_DIRECTORY),
        }
    }

    /// Resolve the path for a well-known configuration file.
    pub fn get_config_file(&self, config_file: WellKnownConfigFile) -> PathBuf {
        let name = match config_file {
            WellKnownConfigFile::Worker => constants::path::WORKER_SETTINGS_FILE,
            WellKnownConfigFile::WorkerOverride => constants::path::WORKER_OVERRIDE_FILE,
            WellKnownConfigFile::Credentials => constants::path::CREDENTIALS_FILE,
        };
        self.root.join(name)
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token cancelled when the worker shuts down. Per-task tokens are
    /// children of this one.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Initiate shutdown. Only the first reason is kept.
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut guard = self.shutdown_reason.lock();
            if guard.is_some() {
                return;
            }
            *guard = Some(reason);
        }
        let trace = self.get_trace("HostContext");
        render_sdk::TraceWriter::info(
            &trace,
            &format!("Worker will be shut down for {reason}"),
        );
        self.shutdown_token.cancel();
    }
}
