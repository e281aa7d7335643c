//! busterbunny command line
//!
//! Validate a bus configuration, raise a single event, or listen on the
//! configured queues.

use busterbunny::observability::init_default_logging;
use busterbunny::{BusConfig, BusSignal, EventBus, SignalKind};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["busterbunny.toml", "config/busterbunny.toml"];

/// Resilient AMQP event bus client
#[derive(Parser)]
#[command(name = "busterbunny")]
#[command(about = "Publish and consume domain events over AMQP")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Config {
        /// Print the effective configuration with the password masked
        #[arg(long)]
        show: bool,
    },
    /// Raise one event and wait until it is published
    Publish {
        /// Routing key for the event
        event_id: String,
        /// Event body as JSON
        event: String,
    },
    /// Consume the configured queues and acknowledge every event until Ctrl-C
    Listen,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Publish { event_id, event } => publish_event(config, &event_id, &event).await,
        Commands::Listen => listen(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<BusConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BusConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BusConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create one of: {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )
    .into())
}

fn handle_config_command(config: &BusConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        let mut redacted = config.clone();
        redacted.cluster.password = "****".to_string();
        println!("Broker URL: {}", config.cluster.redacted_url());
        println!("{}", toml::to_string_pretty(&redacted)?);
    }

    info!("Configuration is valid");
    Ok(())
}

fn log_lifecycle(signal: &BusSignal) {
    match signal {
        BusSignal::WarningRaised { message } => warn!("{}", message),
        BusSignal::Error { message } => error!("{}", message),
        BusSignal::Stats(snapshot) => info!(stats = ?snapshot, "Event bus stats"),
        other => info!(signal = ?other.kind(), "Event bus signal"),
    }
}

async fn publish_event(
    config: BusConfig,
    event_id: &str,
    event: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let event: Value = serde_json::from_str(event)?;
    let bus = EventBus::builder(config).on_any(log_lifecycle).build()?;

    let result = bus.publish(event_id, &event, None).await;
    bus.disconnect().await;
    result?;

    info!(event_id = %event_id, "Event published");
    Ok(())
}

async fn listen(config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bus = EventBus::builder(config).on_any(log_lifecycle).build()?;

    bus.subscribe(|event, message| {
        info!(
            queue = %message.queue(),
            routing_key = %message.routing_key(),
            event = %event,
            "Received event"
        );
        if let Err(e) = message.acknowledge() {
            warn!("Failed to acknowledge event: {}", e);
        }
    })?;

    let ready = bus.on(SignalKind::Ready, |_| info!("Listening for events, Ctrl-C to stop"));
    signal::ctrl_c().await?;
    bus.off(ready);

    info!("Shutting down");
    bus.disconnect().await;
    Ok(())
}
