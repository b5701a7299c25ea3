//! tokenwatch daemon
//!
//! Keeps a token module initialized while the host is in the foreground and
//! reports token insertions and removals. Host lifecycle changes arrive as
//! POSIX signals; without hardware the daemon drives a simulated module.

mod config;
mod service;
mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use config::TokendConfig;
use presence::{SimulatedDriver, TokenDriver, TokenWatch};
use simulation::Churn;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tokend")]
#[command(author, version, about = "tokenwatch daemon - token presence and driver lifecycle")]
#[command(long_about = "
Keeps a cryptographic token module in step with the host lifecycle and
reports a normalized stream of token insertions and removals.

SIGNALS:
    SIGUSR1    host moved to the background (finalize the module)
    SIGUSR2    host moved to the foreground (initialize the module)
    SIGHUP     transient configuration change (module stays initialized)
    SIGINT     finalize and exit

EXAMPLES:
    # Run with default config
    tokend

    # Run with custom config
    tokend --config /path/to/tokend.toml

    # Show the slots of the module and exit
    tokend --list-slots

    # Run as systemd service with debug logging
    tokend --service --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/tokenwatch/tokend.toml
    3. /etc/tokenwatch/tokend.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service
    #[arg(long)]
    service: bool,

    /// List module slots and exit
    #[arg(long)]
    list_slots: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = TokendConfig::default();
        let path = TokendConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        TokendConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        TokendConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("tokenwatch daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let mut driver = SimulatedDriver::new(config.simulation.slots);
    if let Some(timeout) = config.simulation.poll_timeout() {
        driver = driver.with_poll_timeout(timeout);
    }
    let driver = Arc::new(driver);

    if args.list_slots {
        return list_slots_mode(driver.as_ref());
    }

    let service_mode = args.service || config.daemon.service_mode;
    if service_mode && service::is_systemd() {
        info!("Running under systemd");
    }

    run(config, driver, service_mode).await
}

/// Print every slot of the module and exit
fn list_slots_mode(driver: &SimulatedDriver) -> Result<()> {
    driver.initialize().context("Failed to initialize token module")?;

    let slots = driver.slot_ids();
    println!("Found {} slot(s):\n", slots.len());
    for slot in slots {
        let snapshot = driver
            .slot_snapshot(slot)
            .with_context(|| format!("Failed to query {}", slot))?;
        println!("  [{}] {}", slot, snapshot.description);
        match &snapshot.serial {
            Some(serial) if snapshot.present => {
                println!("      Token: {} (serial {})", snapshot.manufacturer, serial)
            }
            _ => println!("      No token"),
        }
        println!();
    }

    driver.finalize().context("Failed to finalize token module")?;
    Ok(())
}

async fn run(config: TokendConfig, driver: Arc<SimulatedDriver>, service_mode: bool) -> Result<()> {
    let watch = TokenWatch::start(driver.clone(), config.token_watch_config())
        .context("Failed to start token watch")?;

    let events = watch.normalizer().subscribe_fn(|event| {
        if event.synthetic {
            info!("Token event: {} (repaired)", event);
        } else {
            info!("Token event: {}", event);
        }
    });
    let status = spawn_status_reporter(&watch, service_mode);

    if config.lifecycle.start_initialized {
        watch.controller().on_host_foreground();
    }
    watch
        .controller()
        .sync()
        .await
        .context("Lifecycle worker stopped during startup")?;
    let first_token = spawn_first_token_report(&watch);

    let churn = config.simulation.churn_interval().map(|interval| {
        info!("Simulating token activity every {:?}", interval);
        Churn::new(
            driver.clone(),
            &config.simulation.serial_prefix,
            config.simulation.seed,
        )
        .spawn(interval)
    });

    if service_mode {
        service::notify_ready().context("Failed to notify systemd ready")?;
    }
    info!("Press Ctrl+C to shutdown");

    let result = wait_for_signals(&watch).await;

    if service_mode {
        if let Err(e) = service::notify_stopping() {
            warn!("Failed to notify systemd stopping: {:#}", e);
        }
    }

    if let Some(churn) = churn {
        churn.abort();
    }
    first_token.abort();

    watch.shutdown().await.context("Failed to stop token watch")?;
    status.abort();
    events.abort();

    info!("Daemon shutdown complete");
    result
}

/// Map host lifecycle signals onto the controller until Ctrl+C
async fn wait_for_signals(watch: &TokenWatch) -> Result<()> {
    let mut background = unix_signal(SignalKind::user_defined1())
        .context("Failed to install SIGUSR1 handler")?;
    let mut foreground = unix_signal(SignalKind::user_defined2())
        .context("Failed to install SIGUSR2 handler")?;
    let mut reconfigure =
        unix_signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let controller = watch.controller();

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            _ = background.recv() => {
                info!("Host moved to the background");
                controller.on_host_background(false);
            }
            _ = foreground.recv() => {
                info!("Host moved to the foreground");
                controller.on_host_foreground();
            }
            _ = reconfigure.recv() => {
                info!("Host configuration change");
                controller.on_host_background(true);
                controller.on_host_foreground();
            }
        }
    }
}

/// Log lifecycle status changes and mirror them to systemd
fn spawn_status_reporter(watch: &TokenWatch, service_mode: bool) -> JoinHandle<()> {
    let mut status = watch.controller().watch_status();
    let registry = watch.registry().clone();

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if let Some(error) = &current.last_error {
                warn!("Lifecycle {} with error: {}", current.state, error);
            } else {
                info!("Lifecycle {} (session {})", current.state, current.generation);
            }

            if service_mode {
                let line = service::status_line(&current, registry.len());
                if let Err(e) = service::notify_status(&line) {
                    warn!("Failed to send status to systemd: {:#}", e);
                }
            }
        }
    })
}

/// Report the first token that becomes available
fn spawn_first_token_report(watch: &TokenWatch) -> JoinHandle<()> {
    let registry = watch.registry().clone();

    tokio::spawn(async move {
        match registry.first_available().await {
            Ok(device) => info!("First token available: {}", device),
            Err(e) => debug!("Stopped waiting for a token: {}", e),
        }
    })
}
