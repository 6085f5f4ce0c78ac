//! mqtt-bridge - MQTT 3.1.1 front end for an AMQP 1.0 messaging backbone.
//!
//! Runs standalone: sessions talk to an in-memory backbone answered by the
//! loopback Will and Subscription services.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_bridge::amqp::MemoryRouter;
use mqtt_bridge::{Bridge, BridgeConfig, LoopbackServices};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// MQTT to AMQP bridge.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge")]
#[command(about = "Bridge MQTT clients onto AMQP 1.0 services")]
#[command(version)]
struct Args {
    /// Config file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT listen address, overrides the config file (e.g. 0.0.0.0:1883)
    #[arg(short, long)]
    listen: Option<String>,

    /// Messaging backbone URL, overrides the config file
    #[arg(long)]
    messaging_url: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<BridgeConfig> {
        let mut config = match self.config {
            Some(ref path) => BridgeConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(ref listen) = self.listen {
            config = config.with_listen_addr(listen.clone());
        }
        if let Some(ref url) = self.messaging_url {
            config = config.with_messaging_url(url.clone());
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.load_config()?;
    info!(
        "messaging backbone {} (container {})",
        config.messaging_url, config.container_id
    );

    let router = MemoryRouter::new();
    let _services = LoopbackServices::start(&router);

    let bridge = Bridge::builder(config, Arc::new(router.connector()))
        .on_connect(|client_id| info!("client {} connected", client_id))
        .on_disconnect(|client_id| info!("client {} disconnected", client_id))
        .build()?;
    let bridge = Arc::new(bridge);

    let serving = Arc::clone(&bridge);
    let mut server = tokio::spawn(async move { serving.serve().await });

    tokio::select! {
        result = &mut server => {
            result.context("bridge task panicked")??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("cannot listen for ctrl-c: {}", e);
            }
        }
    }

    info!("shutting down");
    bridge.shutdown();
    server.await.context("bridge task panicked")??;
    Ok(())
}
