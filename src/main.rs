use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vnet::config::{self, Config, UplinkMode};
use vnet::session::{run_backup, run_master, serve, Overlay};
use vnet::telemetry::init_logging;

/// Period of the status line
const STATUS_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "vnet")]
#[command(about = "A layer-2 overlay switch over framed TCP links")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the overlay daemon
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config.toml
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config {
            action: ConfigAction::Validate { config },
        }) => cmd_config_validate(&config),
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(&PathBuf::from("config.toml")),
    };
    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_checked(config_path: &PathBuf) -> Result<Config, String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to load config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }
    Ok(cfg)
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());
    load_checked(config_path)?;
    println!("[INFO] Configuration is valid");
    Ok(())
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    let cfg = load_checked(config_path)?;
    init_logging(Some(&cfg.log));
    info!(config = %config_path.display(), node = %cfg.node.name, "vnet starting");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<(), String> {
    let overlay = Arc::new(
        Overlay::from_config(&cfg).map_err(|e| format!("Failed to set up overlay: {}", e))?,
    );
    let _background = overlay.spawn_background();
    info!(
        dynamic = overlay.is_dynamic(),
        zones = ?overlay.static_zones(),
        cipher = %overlay.settings.cipher,
        conntrack = overlay.conntrack.is_some(),
        "overlay ready"
    );

    if let Some(listen) = &cfg.node.listen {
        let listener = tokio::net::TcpListener::bind(listen.as_str())
            .await
            .map_err(|e| format!("Failed to listen on {}: {}", listen, e))?;
        let overlay = Arc::clone(&overlay);
        tokio::spawn(async move {
            if let Err(e) = serve(overlay, listener).await {
                warn!(error = %e, "listener stopped");
            }
        });
    }

    for uplink in &cfg.uplinks {
        match uplink.mode {
            UplinkMode::Each => {
                for addr in &uplink.addrs {
                    tokio::spawn(run_master(Arc::clone(&overlay), addr.clone()));
                }
            }
            UplinkMode::Backup => {
                tokio::spawn(run_backup(Arc::clone(&overlay), uplink.addrs.clone()));
            }
        }
    }

    let status = {
        let overlay = Arc::clone(&overlay);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = overlay.snapshot();
                let macs: usize = snapshot
                    .zones
                    .iter()
                    .flat_map(|z| &z.ports)
                    .map(|p| p.macs.len())
                    .sum();
                info!(
                    zones = snapshot.zones.len(),
                    macs,
                    flows = snapshot.conntrack.len(),
                    links = snapshot.links.len(),
                    masters = overlay.masters.len(),
                    "status"
                );
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to wait for ctrl-c: {}", e))?;
    info!("shutting down");
    status.abort();
    Ok(())
}
