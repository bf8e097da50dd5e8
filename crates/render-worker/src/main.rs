// Entry point of the render worker.
//
// Parses CLI args, loads settings and credentials from the worker root,
// wires up the manager client and command handlers, and runs the
// TaskScheduler on a single-threaded runtime until shutdown.

use clap::Parser;
use render_common::constants::return_code;
use render_common::{ConfigurationStore, HostContext, ShutdownReason, CURRENT_PLATFORM};
use render_sdk::{Source, WorkerPackage};
use render_worker::{
    CommandRegistry, HttpManagerClient, ManagerClient, TaskScheduler, WorkerIdentity,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line arguments of the worker.
#[derive(Parser, Debug)]
#[command(name = "render-worker", version, about = "Render farm worker")]
struct Args {
    /// Worker root directory holding `.worker`, `.credentials` and `_diag`.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Manager URL, overriding the configured one.
    #[arg(long)]
    manager_url: Option<String>,

    /// Exit after one task has been executed and reported.
    #[arg(long)]
    once: bool,

    /// Print the effective settings and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(return_code::TERMINATED_ERROR);
        }
    };

    let exit_code = runtime.block_on(run(args));
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Render worker starting.");
    tracing::info!("  Version  = {}", WorkerPackage::VERSION);
    tracing::info!("  Commit   = {}", Source::COMMIT_HASH);
    tracing::info!("  Platform = {}", CURRENT_PLATFORM);
    tracing::info!("  Root     = {}", args.root.display());

    let context = HostContext::new(args.root.clone());
    let trace = context.get_trace("Worker");
    let store = Arc::new(ConfigurationStore::new(&context));
    if !store.is_configured() {
        tracing::info!("No .worker file in the root, using defaults and environment");
    }

    let mut settings = match store.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            trace.error_chain(&e.context("Failed to load settings"));
            return return_code::CONFIGURATION_ERROR;
        }
    };
    if let Some(manager_url) = args.manager_url {
        settings.manager_url = manager_url;
    }

    if args.print_config {
        return match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                println!("{json}");
                return_code::SUCCESS
            }
            Err(e) => {
                tracing::error!("Failed to print settings: {}", e);
                return_code::TERMINATED_ERROR
            }
        };
    }

    if let Err(e) = settings.validate() {
        tracing::error!("Invalid configuration: {:#}", e);
        return return_code::CONFIGURATION_ERROR;
    }
    let settings = Arc::new(settings);

    let identity = match WorkerIdentity::load_or_create(store.clone(), &settings) {
        Ok(identity) => identity,
        Err(e) => {
            trace.error_chain(&e.context("Failed to load worker credentials"));
            return return_code::CONFIGURATION_ERROR;
        }
    };
    context.secret_masker.add_value(identity.secret());

    let manager: Arc<dyn ManagerClient> =
        match HttpManagerClient::new(&settings.manager_url, settings.request_timeout()) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!("Failed to create manager client: {:#}", e);
                return return_code::CONFIGURATION_ERROR;
            }
        };

    let registry = Arc::new(CommandRegistry::with_builtin_commands(Arc::new(
        context.get_trace("Commands"),
    )));

    spawn_signal_handlers(context.clone());

    let scheduler = TaskScheduler::new(context.clone(), settings, manager, identity, registry)
        .with_run_once(args.once);

    match scheduler.run().await {
        Ok(()) => {
            tracing::info!(
                "Worker stopped ({})",
                context
                    .shutdown_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "no reason".into())
            );
            return_code::SUCCESS
        }
        Err(e) => {
            tracing::error!("Worker failed: {}", e);
            return_code::TERMINATED_ERROR
        }
    }
}

/// Ctrl-C and SIGTERM start a graceful shutdown.
fn spawn_signal_handlers(context: Arc<HostContext>) {
    let context_for_ctrl_c = context.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, shutting down");
                context_for_ctrl_c.shutdown(ShutdownReason::UserCancelled);
            }
            Err(e) => tracing::warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("SIGTERM received, shutting down");
                context.shutdown(ShutdownReason::OperatingSystemShutdown);
            }
            Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
        }
    });
}
