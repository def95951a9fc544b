//! routebeacon binary entry point.

use clap::Parser;
use routebeacon::{bootstrap, telemetry, Config, Daemon};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Announce DNS-resolved destinations as BGP /32 host routes.
#[derive(Parser, Debug)]
#[command(name = "routebeacon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "routebeacon.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("ROUTEBEACON")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        api = %config.api.address,
        dns_servers = config.dns.servers.len(),
        "starting routebeacon"
    );

    let domains = bootstrap::fetch(&config.bootstrap).await?;
    info!(domains = domains.len(), "bootstrap domain list ready");

    // Setup graceful shutdown
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let daemon = Daemon::new(config, domains)?;
    if let Err(err) = daemon.run(cancel).await {
        error!(%err, "daemon failed");
        return Err(err.into());
    }

    info!("routebeacon shutdown complete");
    Ok(())
}
