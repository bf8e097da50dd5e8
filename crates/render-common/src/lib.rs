// render-common: shared infrastructure for the render worker.
// Depends on `render-sdk`; used by the `render-worker` engine and binary.

pub mod config_store;
pub mod constants;
pub mod credential_data;
pub mod host_context;
pub mod http_client_factory;
pub mod logging;
pub mod secret_masker;
pub mod task_status;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config_store::{ConfigurationStore, WorkerSettings};
pub use constants::{OsPlatform, WellKnownConfigFile, WellKnownDirectory, CURRENT_PLATFORM};
pub use credential_data::WorkerCredentials;
pub use host_context::{HostContext, ShutdownReason};
pub use http_client_factory::HttpClientFactory;
pub use logging::TaskLogger;
pub use secret_masker::SecretMasker;
pub use task_status::TaskStatus;
pub use tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
