//! mooring — supervise a fleet of MCP tool-server processes from a TOML
//! config file.

use clap::{Parser, Subcommand};
use mooring_core::MooringResult;
use mooring_mcp::{stdio_factory, ConnectionState, RetryPolicy, ServerDescriptor, Supervisor};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config_watcher;

use config_watcher::{parse_config, ConfigWatcher, MooringConfig};

#[derive(Parser)]
#[command(name = "mooring", about = "mooring — MCP tool-server connection supervisor")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "mooring.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect all configured servers and supervise them until ctrl-c
    Run {
        /// Reload the config file on change and apply the difference
        #[arg(long)]
        watch: bool,
    },
    /// Parse the config file and list the configured servers
    Check,
}

#[tokio::main]
async fn main() -> MooringResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => check(&cli.config),
        Commands::Run { watch } => run(cli.config, watch).await,
    }
}

fn check(config_path: &Path) -> MooringResult<()> {
    let config = parse_config(config_path)?;
    println!("{} server(s) configured:", config.servers.len());
    for server in &config.servers {
        let state = if server.enabled { "enabled" } else { "disabled" };
        println!(
            "  {:<24} {} {} ({state})",
            server.name,
            server.command,
            server.args.join(" "),
        );
    }
    Ok(())
}

async fn run(config_path: PathBuf, watch: bool) -> MooringResult<()> {
    let config = parse_config(&config_path)?;
    let supervisor = Supervisor::new(stdio_factory(), RetryPolicy::default());

    let errors = supervisor.connect_all(config.servers).await;
    if !errors.is_empty() {
        warn!(failed = errors.len(), "Some servers failed to connect");
    }
    print_statuses(&supervisor);

    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::unbounded_channel();
    let _watcher = if watch {
        Some(ConfigWatcher::start(
            config_path.clone(),
            500,
            move |config| {
                let _ = reload_tx.send(config);
            },
        )?)
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(config) = reload_rx.recv() => {
                apply_config(&supervisor, config).await;
                print_statuses(&supervisor);
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

/// Bring the supervisor in line with a freshly reloaded config: remove
/// servers that disappeared, register/update the rest (the supervisor
/// restarts any whose launch parameters changed), and connect servers
/// that are not already up.
async fn apply_config(supervisor: &Supervisor, config: MooringConfig) {
    info!("Applying reloaded configuration");

    let keep: HashSet<String> = config.servers.iter().map(|s| s.name.clone()).collect();
    for name in supervisor.server_names() {
        if !keep.contains(&name) {
            info!(server = %name, "Server dropped from config, removing");
            supervisor.remove_descriptor(&name).await;
        }
    }

    for descriptor in config.servers {
        // Read before set_descriptor: a live server whose launch changed
        // is restarted by set_descriptor itself and must not be connected
        // a second time here.
        let needs_connect = supervisor.get_status(&descriptor.name).map_or(true, |s| {
            matches!(
                s.state,
                ConnectionState::Disconnected | ConnectionState::Disabled
            )
        });
        supervisor.set_descriptor(descriptor.clone()).await;
        if descriptor.enabled && needs_connect {
            if let Err(e) = supervisor.connect_server(descriptor).await {
                warn!(error = %e, "Reloaded server failed to connect");
            }
        }
    }
}

fn print_statuses(supervisor: &Supervisor) {
    let mut statuses: Vec<(String, ServerDescriptor)> = Vec::new();
    for name in supervisor.server_names() {
        if let Some(descriptor) = supervisor.get_descriptor(&name) {
            statuses.push((name, descriptor));
        }
    }
    statuses.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, descriptor) in statuses {
        let Some(status) = supervisor.get_status(&name) else {
            continue;
        };
        let detail = status
            .last_error
            .map(|e| format!(" ({e})"))
            .unwrap_or_default();
        println!(
            "{name:<24} {:<12} retries={} cmd={}{detail}",
            format!("{:?}", status.state).to_lowercase(),
            status.retry_count,
            descriptor.command,
        );
    }
}
