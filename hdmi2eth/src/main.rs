//! HDMI2ETH SoC runtime: entry point.
//!
//! ```text
//! hdmi2eth                    Run in the foreground
//! hdmi2eth --config <path>    Load a custom config TOML
//! hdmi2eth --gen-config       Write default config to stdout
//! hdmi2eth --export-map       Print the address map and clock topology as JSON
//! ```

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hdmi2eth::config::SocConfig;
use hdmi2eth::service::SocService;
use hdmi2eth_core::map::MapExport;
use hdmi2eth_core::{ClockTopology, Soc};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "hdmi2eth", about = "HDMI2ETH SoC runtime")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "hdmi2eth.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Build the SoC, print its address map and clock topology as JSON
    /// and exit.
    #[arg(long)]
    export_map: bool,
}

/// Everything `--export-map` prints.
#[derive(Serialize)]
struct Export<'a> {
    map: MapExport,
    clocks: &'a ClockTopology,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&SocConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = SocConfig::load(&cli.config);

    // --export-map: verify the layout and dump it.
    if cli.export_map {
        let soc = Soc::build(config.to_params())?;
        let export = Export {
            map: soc.map().export(),
            clocks: soc.topology(),
        };
        println!("{}", serde_json::to_string_pretty(&export)?);
        return Ok(());
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("hdmi2eth v{}", env!("CARGO_PKG_VERSION"));
    info!("station {} at {}", config.network.mac, config.network.ip);
    info!("bridge port: {}", config.network.control_port);
    info!(
        "stream port: {} -> {}",
        config.network.stream_port, config.network.stream_destination
    );

    let service = SocService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
