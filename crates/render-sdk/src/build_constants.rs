//! Build constants for the worker package.
//! Values come from compile-time environment variables with fallbacks.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash this binary was built from.
    /// Set via `RENDER_WORKER_COMMIT_HASH` at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("RENDER_WORKER_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Worker package metadata.
#[derive(Debug, Clone)]
pub struct WorkerPackage;

impl WorkerPackage {
    /// The semantic version of the worker, taken from `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Product name used in the HTTP user agent.
    pub const PRODUCT_NAME: &'static str = "render-worker";

    /// Returns the user agent string sent with every manager request.
    pub fn user_agent() -> String {
        format!("{}/{}", Self::PRODUCT_NAME, Self::VERSION)
    }
}
