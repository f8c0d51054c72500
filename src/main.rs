//! capserve: capability invocation server.
//!
//! Serves registered capabilities over a strictly sequential line session
//! (stdin/stdout) or a concurrent HTTP endpoint, selected by configuration
//! or the `--transport` flag.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use capserve::builtin;
use capserve::config::{self, Config, TransportMode};
use capserve::dispatch::{DispatchOptions, Dispatcher};
use capserve::error::TransportError;
use capserve::metrics::MetricsRegistry;
use capserve::middleware::MiddlewareChain;
use capserve::registry::CapabilityRegistry;
use capserve::shutdown::{self, ShutdownCoordinator};
use capserve::transport::http::ConcurrentEndpoint;
use capserve::transport::line::{LineSession, LineTransport};

/// Capability invocation server.
///
/// Validates incoming requests against declared schemas and dispatches them
/// to registered handlers through a recovery/logging/metrics pipeline.
#[derive(Parser, Debug)]
#[command(name = "capserve")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Override the configured transport
    #[arg(short, long, value_enum)]
    transport: Option<TransportMode>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
///
/// Diagnostics go to stderr; stdout is reserved for line-transport framing.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Entry point for the capserve server.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let mut cfg = match config::load_config(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(transport) = args.transport {
        cfg.server.transport = transport;
    }
    if let Err(e) = cfg.validate() {
        eprintln!("Configuration error: {e}");
        return ExitCode::FAILURE;
    }

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cfg.server.transport,
        "starting capserve server"
    );

    // Registry and middleware are frozen before any transport accepts
    // traffic; a duplicate name is fatal here.
    let mut registry = CapabilityRegistry::new();
    if let Err(e) = builtin::register_builtin(&mut registry) {
        error!(error = %e, "capability registration failed");
        return ExitCode::FAILURE;
    }
    let registry = Arc::new(registry);

    let metrics = Arc::new(MetricsRegistry::new());
    let chain = MiddlewareChain::standard(Arc::clone(&metrics), cfg.server.name.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        chain,
        Arc::clone(&metrics),
        cfg.server.name.clone(),
        DispatchOptions {
            record_validation_failures: cfg.metrics.record_validation_failures,
        },
    ));

    let coordinator = ShutdownCoordinator::new();
    let grace = Duration::from_secs(cfg.shutdown.grace_seconds);

    let result = match cfg.server.transport {
        TransportMode::Line => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to create Tokio runtime");
            runtime.block_on(run_line(&cfg, dispatcher, coordinator, grace))
        }
        TransportMode::Concurrent => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("Failed to create Tokio runtime");
            runtime.block_on(run_concurrent(
                &cfg,
                dispatcher,
                registry,
                metrics,
                coordinator,
                grace,
            ))
        }
    };

    match result {
        Ok(()) => {
            info!("server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

/// Runs the strictly sequential line session.
async fn run_line(
    cfg: &Config,
    dispatcher: Arc<Dispatcher>,
    coordinator: ShutdownCoordinator,
    grace: Duration,
) -> Result<(), TransportError> {
    tokio::spawn(shutdown::listen_for_signals(coordinator.clone()));

    info!("line session ready on stdin/stdout");
    LineSession::new(
        LineTransport::stdio(),
        dispatcher,
        coordinator,
        grace,
        cfg.server.max_request_bytes,
    )
    .run()
    .await?;
    Ok(())
}

/// Runs the concurrent HTTP endpoint.
async fn run_concurrent(
    cfg: &Config,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<CapabilityRegistry>,
    metrics: Arc<MetricsRegistry>,
    coordinator: ShutdownCoordinator,
    grace: Duration,
) -> Result<(), TransportError> {
    let bind = cfg.server.bind_addr().map_err(|e| TransportError::Serve {
        message: e.to_string(),
    })?;

    tokio::spawn(shutdown::listen_for_signals(coordinator.clone()));

    ConcurrentEndpoint::new(
        bind,
        dispatcher,
        registry,
        metrics,
        coordinator,
        grace,
        cfg.server.max_request_bytes,
    )
    .serve()
    .await
}
