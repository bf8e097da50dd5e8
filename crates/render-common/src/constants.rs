// Constants shared by the render worker crates: well-known directories and
// files, platform detection, manager API paths, environment variable names
// and process return codes.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Well-known directories below the worker root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Root,
    Diag,
    TaskLogs,
    Work,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Well-known configuration files below the worker root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    Worker,
    WorkerOverride,
    Credentials,
}

impl fmt::Display for WellKnownConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Operating system platform, as reported to the manager on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    Darwin,
    Windows,
}

impl OsPlatform {
    /// Wire name sent in the `platform` field of the registration request.
    pub fn as_str(&self) -> &'static str {
        match self {
            OsPlatform::Linux => "linux",
            OsPlatform::Darwin => "darwin",
            OsPlatform::Windows => "windows",
        }
    }
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

/// The current OS platform, detected at compile time.
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Darwin;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

// ---------------------------------------------------------------------------
// Manager API
// ---------------------------------------------------------------------------

/// Paths of the manager endpoints the worker talks to.
pub mod manager_api {
    pub const REGISTER_WORKER: &str = "/register-worker";
    pub const SIGN_ON: &str = "/sign-on";
    pub const SIGN_OFF: &str = "/sign-off";
    pub const TASK: &str = "/task";

    /// `POST /task/{id}/status`
    pub fn task_status(task_id: &str) -> String {
        format!("/task/{task_id}/status")
    }

    /// `GET /may-i-run/{id}`
    pub fn may_i_run(task_id: &str) -> String {
        format!("/may-i-run/{task_id}")
    }
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

/// Environment variables applied on top of the persisted settings.
pub mod env {
    pub const MANAGER_URL: &str = "RENDER_WORKER_MANAGER_URL";
    pub const JOB_TYPES: &str = "RENDER_WORKER_JOB_TYPES";
    pub const NICKNAME: &str = "RENDER_WORKER_NICKNAME";
    /// When true, the trace manager also prints component traces to stdout.
    pub const PRINT_TRACE_TO_STDOUT: &str = "RENDER_WORKER_PRINT_TRACE_TO_STDOUT";
}

// ---------------------------------------------------------------------------
// ReturnCode
// ---------------------------------------------------------------------------

/// Process return / exit codes.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
}

// ---------------------------------------------------------------------------
// Path constants
// ---------------------------------------------------------------------------

pub mod path {
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const TASK_LOG_DIRECTORY: &str = "tasks";
    pub const WORK_DIRECTORY: &str = "_work";
    pub const WORKER_SETTINGS_FILE: &str = ".worker";
    pub const WORKER_OVERRIDE_FILE: &str = ".worker.override";
    pub const CREDENTIALS_FILE: &str = ".credentials";
}

/// Reason used when a task names a command no handler is registered for.
pub fn unsupported_command_reason(name: &str) -> String {
    format!("unsupported command \"{name}\"")
}
