//! Channel dispatcher binary.
//!
//! Loads configuration, installs logging, metrics and signal handling, then
//! hands control to the lifecycle orchestrator until shutdown.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use channel_dispatcher::config::{self, ConfigWatcher, DispatcherConfig};
use channel_dispatcher::http::HttpFanout;
use channel_dispatcher::lifecycle::{signals, LifecycleOrchestrator, StopSignal};
use channel_dispatcher::observability::{
    logging, metrics, sampling, LoggingConfig, SamplingPolicy, TracingConfig,
};
use channel_dispatcher::watch::FileStore;

#[derive(Debug, Parser)]
#[command(name = "channel-dispatcher", version, about = "In-memory channel dispatcher")]
struct Cli {
    /// Dispatcher config file (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channel manifest to watch; overrides `store.channels_path`.
    #[arg(long)]
    channels: Option<String>,

    /// Port to listen on; overrides the port of `listener.bind_address`.
    #[arg(long)]
    port: Option<u16>,

    /// Use the built-in logging config instead of loading and watching one.
    #[arg(long)]
    hard_coded_logging_config: bool,

    /// Logging config file; overrides `observability.logging_config_path`.
    #[arg(long)]
    logging_config: Option<String>,

    /// Tracing config file; overrides `observability.tracing_config_path`.
    #[arg(long)]
    tracing_config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => DispatcherConfig::default(),
    };
    apply_overrides(&mut config, &cli);

    let logging_config = if cli.hard_coded_logging_config {
        LoggingConfig::default()
    } else {
        let path = &config.observability.logging_config_path;
        match LoggingConfig::load(Path::new(path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load logging config {path}: {e}");
                return ExitCode::FAILURE;
            }
        }
    };
    let level = match logging::init(&logging_config, logging::COMPONENT) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "channel-dispatcher starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        channels = %config.store.channels_path,
        read_timeout_secs = config.timeouts.read_secs,
        write_timeout_secs = config.timeouts.write_secs,
        "Configuration loaded"
    );

    let tracing_config = match &config.observability.tracing_config_path {
        Some(path) => match std::fs::read_to_string(path)
            .map_err(sampling::SamplingError::from)
            .and_then(|content| TracingConfig::from_toml(&content))
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Failed to set up tracing");
                return ExitCode::FAILURE;
            }
        },
        None => TracingConfig::default(),
    };
    let sampling_policy = SamplingPolicy::new(tracing_config);

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to install metrics exporter");
                    return ExitCode::FAILURE;
                }
            }
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
                return ExitCode::FAILURE;
            }
        }
    }

    let stop = StopSignal::new();
    if let Err(e) = signals::install(stop.clone()) {
        tracing::error!(error = %e, "Failed to register signal handlers");
        return ExitCode::FAILURE;
    }

    let mut watcher = ConfigWatcher::new();
    if !cli.hard_coded_logging_config {
        watcher.watch(
            &config.observability.logging_config_path,
            logging::update_level_from_config(level),
        );
    }
    if let Some(path) = &config.observability.tracing_config_path {
        watcher.watch(path, sampling::update_sampling_from_config(sampling_policy.clone()));
    }

    let store = FileStore::new(&config.store.channels_path);
    let delivery = Arc::new(HttpFanout::new());

    let result = match LifecycleOrchestrator::new(&config, store, delivery, sampling_policy) {
        Ok(orchestrator) => orchestrator.with_config_watcher(watcher).run(stop).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Dispatcher exited with error");
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(config: &mut DispatcherConfig, cli: &Cli) {
    if let Some(path) = &cli.channels {
        config.store.channels_path = path.clone();
    }
    if let Some(port) = cli.port {
        let host = config
            .listener
            .bind_address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        config.listener.bind_address = format!("{host}:{port}");
    }
    if let Some(path) = &cli.logging_config {
        config.observability.logging_config_path = path.clone();
    }
    if let Some(path) = &cli.tracing_config {
        config.observability.tracing_config_path = Some(path.clone());
    }
}
