use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use core_engine::interface::{TunInterface, TunSettings};
use core_engine::{Server, ServerSettings, StaticAuthenticator};
use shared_utils::config::{Config, ConfigError};
use shared_utils::logging::{init_logging_from_config, LogOverrides};
use shared_utils::tcp::TcpTransportListener;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Overlay VPN server")]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace|debug|info|warn|error), overrides the config file
    #[clap(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[clap(long)]
    json_logs: bool,

    /// Listen address (e.g. 0.0.0.0:8080), overrides the config file
    #[clap(long, value_name = "ADDR")]
    bind: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let path = args.config.clone().unwrap_or_else(Config::default_path);
    match Config::load(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) if args.config.is_none() => Ok(Config::default()),
        Err(err) => {
            Err(err).with_context(|| format!("loading configuration from {}", path.display()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let _guard = init_logging_from_config(
        &config,
        &LogOverrides {
            level: args.log_level.clone(),
            json: args.json_logs,
        },
    );
    info!("Starting overlay server");
    debug!(
        subnet = %config.server.subnet,
        interface = %config.server.interface_name,
        log_dir = ?config.log_dir,
        allow_anonymous = config.security.allow_anonymous,
        "effective configuration"
    );

    let settings = ServerSettings::from_config(&config)?;
    let authenticator = StaticAuthenticator::from_config(&config.security)?;
    if !config.security.allow_anonymous && config.security.xor_key.is_none() {
        warn!("anonymous access is disabled and no XOR key is configured; every connect will be rejected");
    }

    let interface = TunInterface::create(&TunSettings {
        name: config.server.interface_name.clone(),
        subnet: settings.subnet,
        mtu: config.server.mtu,
    })
    .context("creating TUN interface")?;

    let listen_address = args
        .bind
        .clone()
        .unwrap_or_else(|| config.network.listen_address());
    let listener = TcpTransportListener::bind(&listen_address, settings.connection)
        .await
        .with_context(|| format!("binding {listen_address}"))?;

    let server = Arc::new(Server::new(
        settings,
        Arc::new(interface),
        Arc::new(authenticator),
    ));
    server.start().await?;

    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received");
    server.shutdown().await;

    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "listener terminated with error"),
        Err(err) => error!(error = %err, "listener task failed"),
    }

    info!("Overlay server shut down cleanly");
    Ok(())
}
