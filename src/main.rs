//! ATEM GW - binary entry point
//!
//! Loads the config, builds the connection registry and the configured
//! actions, then runs until Ctrl-C (or `exit` in the REPL).

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use atem_gw::actions::{reload_actions, IndicatorSink};
use atem_gw::cli::{Repl, SharedActions};
use atem_gw::config::{AppConfig, ConfigWatcher};
use atem_gw::switcher::simulator::SimulatedDiscovery;
use atem_gw::switcher::ConnectionRegistry;
use atem_gw::tally::Indicator;

const LOG_FILE_BASENAME: &str = "atem-gw.log";

/// ATEM GW - cached switcher state for button controllers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write a daily rolling log file in this directory
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<String>,

    /// Use the simulated switchers from the `simulator` config section
    #[arg(long)]
    simulate: bool,

    /// Start the interactive command prompt
    #[arg(long)]
    repl: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _log_guard = init_logging(&args.log_level, args.log_dir.as_deref())?;

    info!("Starting ATEM GW v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if !args.simulate {
        anyhow::bail!("No hardware switcher backend in this build; run with --simulate");
    }

    // Load configuration with hot-reload watcher
    let (config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let discovery = Arc::new(SimulatedDiscovery::from_config(&initial_config.simulator));
    info!("Simulated switchers: {:?}", discovery.addresses());

    let registry = Arc::new(ConnectionRegistry::new(
        discovery,
        initial_config.registry.settings(),
    ));
    registry.start();

    run_app(
        Arc::clone(&registry),
        (*initial_config).clone(),
        config_watcher,
        args.repl,
        shutdown_signal(),
    )
    .await?;

    info!("ATEM GW shutdown complete");
    Ok(())
}

async fn run_app(
    registry: Arc<ConnectionRegistry>,
    config: AppConfig,
    mut config_watcher: ConfigWatcher,
    with_repl: bool,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let sink = indicator_log_sink();
    let actions: SharedActions = Arc::new(RwLock::new(reload_actions(
        Vec::new(),
        &config.actions,
        &registry,
        &sink,
    )));
    info!("{} actions attached", actions.read().len());
    let mut current = config;

    let mut repl_task = with_repl.then(|| {
        let repl = Repl::new(
            Arc::clone(&registry),
            Arc::clone(&actions),
            tokio::runtime::Handle::current(),
        );
        tokio::task::spawn_blocking(move || repl.run())
    });

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Handle config reload
            Some(new_config) = config_watcher.next_config() => {
                info!("📝 Configuration file changed, reloading actions...");
                if new_config.registry != current.registry || new_config.simulator != current.simulator {
                    warn!("⚠️  Registry and simulator settings apply on restart only");
                }

                let previous = std::mem::take(&mut *actions.write());
                let reloaded = reload_actions(previous, &new_config.actions, &registry, &sink);
                info!("✅ {} actions attached", reloaded.len());
                *actions.write() = reloaded;
                current = new_config;
            }

            // REPL exited
            result = async {
                match repl_task.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            } => {
                match result {
                    Ok(Ok(())) => info!("REPL closed"),
                    Ok(Err(e)) => warn!("REPL failed: {}", e),
                    Err(e) => warn!("REPL task failed: {}", e),
                }
                break;
            }

            // Handle shutdown signal
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    // Cleanup
    info!("Shutting down...");
    for action in actions.write().drain(..) {
        action.detach();
    }
    registry.shutdown().await;
    Ok(())
}

/// Indicator sink for headless runs: log every change
fn indicator_log_sink() -> IndicatorSink {
    Arc::new(|name: &str, indicator: Indicator| {
        info!(action = name, "💡 Indicator {}", indicator.colored());
    })
}

fn init_logging(level: &str, log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir))?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_BASENAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
