use std::path::PathBuf;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager as BtManager;
use clap::Parser;
use log::{debug, info, warn};

mod classifier;
mod config;
mod error;
mod locker;
mod manager;
mod messages;
mod mqtt;
mod scanner;
mod state;

use config::{AppConfig, SamplerBackend};
use locker::{DryRunLocker, Locker, SessionLocker};
use scanner::{BleSampler, HcitoolSampler, Sampler};

/// Locks the session when a paired Bluetooth device leaves.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file (or a file holding only the device address)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Decide as usual but never lock the session
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logger = pretty_env_logger::formatted_timed_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => logger.parse_filters(&filters),
        Err(_) => logger.parse_filters(&cli.log_level),
    };
    logger.init();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    debug!("Config: {:?}", config);

    let sampler = build_sampler(&config).await?;

    let locker: Box<dyn Locker> = if cli.dry_run || config.lock.dry_run {
        info!("Dry run enabled, the session will not be locked");
        Box::new(DryRunLocker)
    } else {
        Box::new(SessionLocker::new(&config.lock))
    };

    let mqtt_client = match &config.mqtt {
        Some(mqtt_config) => {
            let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
            tokio::task::spawn(async move {
                mqtt::MqttClient::event_loop(&mut eventloop).await;
            });
            Some(client)
        }
        None => None,
    };

    let mut core = manager::Manager::new(&config, sampler, locker, mqtt_client);
    core.run_loop(shutdown_signal()).await;

    info!("Exiting, last phase was {}", core.state().phase);
    Ok(())
}

async fn build_sampler(config: &AppConfig) -> anyhow::Result<Box<dyn Sampler>> {
    match config.scan.backend {
        SamplerBackend::Hcitool => Ok(Box::new(HcitoolSampler::new())),
        SamplerBackend::Ble => {
            let bt_manager = BtManager::new()
                .await
                .context("connecting to the Bluetooth stack")?;

            // get the first bluetooth adapter
            let adapters = bt_manager.adapters().await?;
            let central = adapters
                .into_iter()
                .next()
                .context("no Bluetooth adapter found")?;

            // leave some of the sample timeout for stopping the scan
            let scan_window = config.scan.sample_timeout().mul_f64(0.75);
            Ok(Box::new(BleSampler::new(central, scan_window)))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received termination signal"),
    }
}
