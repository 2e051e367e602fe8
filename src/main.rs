//! stationpulse - Main Entry Point

use clap::{Parser, Subcommand};
use stationpulse::config::StationConfig;
use stationpulse::observability::logging::parse_level;
use stationpulse::observability::{LogFormat, init_default_logging, init_logging, metrics};
use stationpulse::protocol::{Clock, PayloadBuilder, SystemClock, TopicSet};
use stationpulse::scheduler::Scheduler;
use stationpulse::stats::{
    Aggregator, DataSource, HealthProbe, HealthSnapshot, SqliteDataSource, SysinfoProbe,
};
use stationpulse::transport::Publisher;
use stationpulse::transport::mqtt::{ConnectionManager, MqttLink, verify_reachable};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Station telemetry agent
#[derive(Parser)]
#[command(name = "stationpulse")]
#[command(about = "Publishes scan statistics and host health to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "STATIONPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Probe the data source, the host and the broker once
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        level => {
            let format = LogFormat::parse(
                &std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            );
            let level = parse_level(if level == 1 { "debug" } else { "trace" });
            init_logging(level, format, false);
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting stationpulse");

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Check => run_checks(config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    explicit: Option<&Path>,
) -> Result<StationConfig, Box<dyn std::error::Error>> {
    let path = StationConfig::locate(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(StationConfig::load_from_file(&path)?)
}

/// Everything a running station needs, built from configuration
struct Station {
    manager: Arc<ConnectionManager<MqttLink>>,
    events: tokio::sync::mpsc::UnboundedReceiver<stationpulse::transport::mqtt::LinkEvent>,
    probe: Arc<dyn HealthProbe>,
    aggregator: Aggregator,
    builder: PayloadBuilder,
}

fn build_station(config: &StationConfig) -> Station {
    let identity = config.device_identity();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let builder = PayloadBuilder::new(TopicSet::new(&identity, &config.topics), clock.clone());

    let (link, events) = MqttLink::new(config.link_settings(), &identity.serial_number);
    let manager = Arc::new(ConnectionManager::new(
        link,
        identity,
        builder.clone(),
        config.publish_policy(),
        config.reconnect_config(),
    ));

    let source: Arc<dyn DataSource> = Arc::new(SqliteDataSource::new(
        &config.datasource.path,
        &config.datasource.table,
        config.datasource.query_timeout(),
    ));
    let aggregator = Aggregator::new(
        source,
        config.aggregation_policy(),
        &config.datasource.no_read_sentinel,
        clock,
    );

    Station {
        manager,
        events,
        probe: Arc::new(SysinfoProbe),
        aggregator,
        builder,
    }
}

async fn run_agent(config: StationConfig) -> Result<(), Box<dyn std::error::Error>> {
    for warning in config.validate() {
        warn!(warning = %warning, "Configuration warning");
    }

    let identity = config.device_identity();
    info!(
        client = %identity.client_name,
        location = %identity.location,
        station = %identity.station,
        serial = %identity.serial_number,
        broker = %config.link_settings().endpoint(),
        "Station identity resolved"
    );

    let station = build_station(&config);
    let manager = station.manager;
    let pump = manager.spawn_event_pump(station.events);

    // A failed first connect is not fatal; every publish retries it
    if let Err(e) = manager.ensure_connected().await {
        warn!(error = %e, "Initial broker connection failed, will retry on first publish");
    }

    let publisher: Arc<dyn Publisher> = manager.clone();
    let scheduler = Scheduler::new(
        station.aggregator,
        station.probe,
        publisher,
        identity,
        station.builder,
        config.publish_policy(),
        config.schedule_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Station is running");

    let scheduler_run = scheduler.run(shutdown_rx);
    tokio::pin!(scheduler_run);

    let scheduler_finished = tokio::select! {
        _ = &mut scheduler_run => {
            warn!("Scheduler stopped without a shutdown request");
            true
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            false
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            false
        }
    };

    // Let an in-flight publish finish before the session closes
    shutdown_tx.send_replace(true);
    if !scheduler_finished {
        scheduler_run.await;
    }

    if let Err(e) = manager.shutdown().await {
        error!("Error during shutdown: {}", e);
    }
    if let Err(e) = pump.await {
        warn!(error = %e, "Connection event pump ended abnormally");
    }

    let snapshot = metrics().get_metrics();
    info!(
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Final metrics"
    );
    Ok(())
}

fn handle_config_command(
    config: &StationConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let warnings = config.validate();
    for warning in &warnings {
        warn!(warning = %warning, "Configuration warning");
    }
    info!(warnings = warnings.len(), "Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

/// One pass over every external dependency; reports each result
async fn run_checks(config: StationConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = 0;
    for warning in config.validate() {
        warn!(warning = %warning, "Configuration warning");
    }

    let station = build_station(&config);
    let window = config.schedule_settings().window;

    match station.aggregator.aggregate(window).await {
        Ok(snapshot) => info!(
            total_items = snapshot.total_items,
            source = %config.datasource.path.display(),
            "Data source check passed"
        ),
        Err(e) => {
            failures += 1;
            error!(
                error = %e,
                source = %config.datasource.path.display(),
                "Data source check failed"
            );
        }
    }

    let probe = station.probe;
    match tokio::task::spawn_blocking(move || HealthSnapshot::collect(probe.as_ref())).await? {
        Ok(health) => info!(
            volumes = health.ready_volumes().count(),
            process_memory_bytes = health.process_memory_bytes,
            "Health probe check passed"
        ),
        Err(e) => {
            failures += 1;
            error!(error = %e, "Health probe check failed");
        }
    }

    // A bare session: no will and no status messages next to a running agent
    let settings = config.link_settings();
    let broker = settings.endpoint();
    let (link, _events) = MqttLink::new(settings, &config.device_identity().serial_number);
    match verify_reachable(&link).await {
        Ok(()) => info!(broker = %broker, "Broker check passed"),
        Err(e) => {
            failures += 1;
            error!(error = %e, broker = %broker, "Broker check failed");
        }
    }

    if failures > 0 {
        return Err(format!("{failures} check(s) failed").into());
    }
    info!("All checks passed");
    Ok(())
}
