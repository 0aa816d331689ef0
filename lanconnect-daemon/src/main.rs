mod config;
mod manager;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanconnect_protocol::plugins::{
    findmyphone::FindMyPhonePluginFactory, photo::PhotoPluginFactory, ping::PingPluginFactory,
    sftp::SftpPluginFactory, PluginRegistry,
};
use lanconnect_protocol::store::{JsonCacheStore, JsonTrustStore};
use lanconnect_protocol::{
    CertificateInfo, DeviceOptions, LanChannelService, LocalContext, PROTOCOL_VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use config::Config;
use manager::DeviceManager;

/// LAN Connect daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "lanconnect-daemon")]
#[command(about = "Connects this computer with paired devices on the local network", long_about = None)]
#[command(version)]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    json_logs: bool,

    /// Configuration file (defaults to <config_dir>/lanconnect/daemon.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run,

    /// Print this device's identity and certificate fingerprint
    Identity,
}

/// Initialize logging based on CLI configuration
fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Logging initialized: level={}, json={}", log_level, cli.json_logs);
    Ok(())
}

/// Registry with the plugins the configuration enables
fn build_registry(config: &Config) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();

    if config.plugins.enable_ping {
        info!("Registering ping plugin");
        registry
            .register_factory(Arc::new(PingPluginFactory))
            .context("Failed to register ping plugin")?;
    }

    if config.plugins.enable_findmyphone {
        info!("Registering findmyphone plugin");
        registry
            .register_factory(Arc::new(FindMyPhonePluginFactory))
            .context("Failed to register findmyphone plugin")?;
    }

    if config.plugins.enable_photo {
        info!("Registering photo plugin");
        registry
            .register_factory(Arc::new(PhotoPluginFactory::new(config.photo_dir())))
            .context("Failed to register photo plugin")?;
    }

    if config.plugins.enable_sftp {
        info!("Registering sftp plugin");
        registry
            .register_factory(Arc::new(SftpPluginFactory))
            .context("Failed to register sftp plugin")?;
    }

    Ok(registry)
}

fn load_certificate(config: &Config, device_id: &str) -> Result<CertificateInfo> {
    CertificateInfo::load_or_generate(&config.paths.cert_dir, device_id)
        .context("Failed to load or generate device certificate")
}

fn print_identity(config: &Config) -> Result<()> {
    let identity = config.identity()?;
    let certificate = load_certificate(config, &identity.device_id)?;

    println!("Device ID:   {}", identity.device_id);
    println!("Name:        {}", identity.device_name);
    println!("Type:        {}", identity.device_type.as_str());
    println!("Protocol:    {}", PROTOCOL_VERSION);
    println!("Port:        {}", identity.tcp_port);
    println!("Fingerprint: {}", certificate.fingerprint);
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    config
        .ensure_directories()
        .context("Failed to create directories")?;
    tokio::fs::create_dir_all(config.photo_dir())
        .await
        .context("Failed to create photo directory")?;

    let identity = config.identity()?;
    let certificate = Arc::new(load_certificate(&config, &identity.device_id)?);
    info!("Certificate fingerprint: {}", certificate.fingerprint);

    let trust = Arc::new(
        JsonTrustStore::open(config.trust_path()).context("Failed to open trusted devices")?,
    );
    let cache = Arc::new(JsonCacheStore::new(config.cache_dir()));

    let local = LocalContext::new(identity, build_registry(&config)?)
        .with_trust_store(trust.clone())
        .with_cache_store(cache)
        .with_transfer_config(config.transfer_config());

    info!(
        "Device: {} ({})",
        local.identity.device_name, local.identity.device_id
    );
    info!("Type: {:?}", local.identity.device_type);
    info!("Protocol version: {}", local.identity.protocol_version);
    info!(
        "Capabilities: {} incoming, {} outgoing",
        local.identity.incoming_capabilities.len(),
        local.identity.outgoing_capabilities.len()
    );

    let service = Arc::new(LanChannelService::new(
        local.identity.clone(),
        certificate,
        trust,
        config.service_config(),
    ));

    let mut manager = DeviceManager::new(service, local, DeviceOptions::default());
    manager.start().await?;
    if let Err(e) = manager.refresh().await {
        warn!("Initial identity broadcast failed: {:#}", e);
    }

    info!("Daemon running, press Ctrl+C to stop");
    let result = tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal");
    info!("Shutting down daemon...");

    for device in manager.devices().await {
        info!(
            "Forgetting {} ({}): connected={}, paired={}",
            device.name().await,
            device.id(),
            device.is_connected(),
            device.is_paired()
        );
    }
    manager.stop().await;
    info!("Daemon shutdown complete");
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli).context("Failed to initialize logging")?;

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    info!("Configuration loaded from {:?}", config_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::Identity => print_identity(&config),
        Command::Run => run(config).await,
    }
}
