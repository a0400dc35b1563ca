//! ---
//! vtnc_section: "07-operator-binary"
//! vtnc_subsection: "binary"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Binary entrypoint for the vtncd operator tool."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use vtnc_common::{init_tracing, AppConfig};
use vtnc_core::Capabilities;
use vtnc_store::load_snapshot;

mod inspect;

use inspect::StartupReport;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("vtncd ", env!("CARGO_PKG_VERSION")),
    about = "VTN coordinator operator tool",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "VTNC_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Load and validate configuration, then print its digest")]
    CheckConfig,
    #[command(about = "Verify the startup snapshot and summarise pools and topology")]
    InspectStartup {
        #[arg(long, value_name = "FILE", help = "Snapshot to inspect instead of the configured one")]
        path: Option<PathBuf>,
        #[arg(long, help = "Print the summary as JSON")]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/vtncd.toml"));
    candidates.push(PathBuf::from("configs/vtncd.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    let load_duration = load_started.elapsed();
    init_tracing("vtncd", &config.logging)?;
    Capabilities::from_config(&config.controllers)
        .context("controller capability table rejected")?;
    let digest = config.digest()?;
    info!(
        config_path = %loaded.source.display(),
        config_hash = %digest,
        load_ms = load_duration.as_millis() as u64,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::CheckConfig) {
        Commands::CheckConfig => {
            println!(
                "Configuration: {}\nControllers: {}\nSHA-256: {}",
                loaded.source.display(),
                config.controllers.len(),
                digest
            );
        }
        Commands::InspectStartup { path, json } => {
            let path = path.unwrap_or_else(|| config.store.startup_path.clone());
            let records = load_snapshot(&path)
                .with_context(|| format!("startup snapshot {} failed verification", path.display()))?;
            let report = StartupReport::build(&config, records)?;
            info!(
                snapshot = %path.display(),
                records = report.records,
                pools = report.pools.len(),
                "startup snapshot verified"
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render(&path));
            }
        }
    }
    Ok(())
}
