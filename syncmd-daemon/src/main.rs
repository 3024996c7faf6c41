use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use syncmd_daemon::{
    build_scheduler, default_config_path, open_replica, peer_state_path, Daemon, DaemonConfig, SyncRoot,
    DEFAULT_LISTEN_ADDR,
};
use syncmd_sync::PeerStateDatabase;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "syncmd")]
#[command(about = "Multi-replica markdown and image sync", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.syncmd/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root to act on when the config has several
    #[arg(short, long, global = true)]
    root: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config with a fresh device id, or add a root to an existing one
    Init {
        /// Directory to keep in sync
        path: PathBuf,

        /// Name for the root (default: the directory name)
        #[arg(short, long)]
        name: Option<String>,

        /// Address to accept peer connections on
        #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
        listen: String,

        /// Replace an existing config instead of adding to it
        #[arg(long)]
        force: bool,
    },

    /// Run the daemon: peer server, scheduler and change intake
    Run,

    /// Index the enabled roots once
    Scan,

    /// Show each root's index summary and known peers
    Status,

    /// List conflicts
    Conflicts {
        /// Include acknowledged conflicts
        #[arg(short, long)]
        all: bool,
    },

    /// Acknowledge a conflict
    Ack {
        /// Conflict id from `syncmd conflicts`
        id: i64,
    },

    /// Run one round with the peer at ADDRESS now
    Sync {
        address: String,
    },
}

fn init_logging(verbose: u8) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => default_config_path(),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig> {
    DaemonConfig::load(&config_path(path)?).context("Run `syncmd init <path>` first")
}

/// The selected root, or every enabled root
fn roots_in_scope<'a>(config: &'a DaemonConfig, name: Option<&str>) -> Result<Vec<&'a SyncRoot>> {
    match name {
        Some(_) => Ok(vec![config.select_root(name)?]),
        None => Ok(config.enabled_roots().collect()),
    }
}

async fn print_status(config: &DaemonConfig, root: &SyncRoot) -> Result<()> {
    let replica = open_replica(config, root).await?;
    let records = replica.store().scan()?;
    let live: Vec<_> = records.iter().filter(|r| !r.deleted).collect();
    let total: u64 = live.iter().map(|r| r.size).sum();

    println!("Root:      {} ({})", root.name, root.path.display());
    println!("Listen:    {}", root.listen_addr);
    println!("Manifest:  #{}", replica.current_sequence()?);
    println!("Files:     {} ({} bytes)", live.len(), total);
    println!("Deleted:   {}", records.len() - live.len());
    println!("Conflicts: {} open", replica.store().list_conflicts(false)?.len());

    let db = PeerStateDatabase::open(peer_state_path(root)).context("Failed to open peer state")?;
    let peers = db.load_peers()?;
    if peers.is_empty() {
        println!("No known peers");
    }
    for peer in peers {
        let seen = peer
            .last_seen
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {} at {}: {} (last seen {}, {} failures)",
            peer.device_id, peer.address, peer.reachability, seen, peer.consecutive_failures
        );
    }
    for round in db.recent_rounds(5)? {
        let outcome = match &round.error {
            Some(e) => format!("failed: {}", e),
            None => format!("{} applied, {} conflicts", round.applied, round.conflicts),
        };
        println!(
            "  round with {} at {}: {}",
            round.peer_device,
            round.finished_at.format("%Y-%m-%d %H:%M:%S"),
            outcome
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Init {
            path: root_path,
            name,
            listen,
            force,
        } => {
            let path = config_path(cli.config)?;
            let root_path = if root_path.is_absolute() {
                root_path
            } else {
                std::env::current_dir().context("Failed to resolve current directory")?.join(root_path)
            };

            let mut config = if path.exists() && !force {
                DaemonConfig::load(&path).context("Existing config is invalid (use --force to replace it)")?
            } else {
                let mut config = DaemonConfig::new(&root_path);
                config.roots.clear();
                config
            };
            if config.roots.iter().any(|r| r.path == root_path) {
                bail!("{} is already a sync root", root_path.display());
            }
            let root = config.add_root(root_path);
            if let Some(name) = name {
                root.name = name;
            }
            root.listen_addr = listen;
            let (root_name, root_path) = (root.name.clone(), root.path.clone());
            config.validate()?;
            config.save(&path)?;

            println!("Device ID: {}", config.device_id);
            println!("Sync root: {} ({})", root_name, root_path.display());
            println!("Config saved to {}", path.display());
        }
        Commands::Run => {
            let config = load_config(cli.config)?;
            let daemon = Daemon::open(config).await?;
            for root in daemon.roots() {
                println!("Root {} listening for peers on {}", root.name(), root.local_addr()?);
            }
            daemon.run().await?;
        }
        Commands::Scan => {
            let config = load_config(cli.config)?;
            for root in roots_in_scope(&config, cli.root.as_deref())? {
                let replica = open_replica(&config, root).await?;
                let summary = replica.indexer().scan().await.context("Scan failed")?;
                println!(
                    "{}: indexed {} files: {} updated, {} removed",
                    root.name, summary.indexed, summary.updated, summary.removed
                );
            }
        }
        Commands::Status => {
            let config = load_config(cli.config)?;
            println!("Device:    {}", config.device_id);
            let scope = match cli.root.as_deref() {
                Some(name) => vec![config.select_root(Some(name))?],
                None => config.roots.iter().collect(),
            };
            for root in scope {
                println!();
                if !root.enabled {
                    println!("Root:      {} ({}) disabled", root.name, root.path.display());
                    continue;
                }
                print_status(&config, root).await?;
            }
        }
        Commands::Conflicts { all } => {
            let config = load_config(cli.config)?;
            let root = config.select_root(cli.root.as_deref())?;
            let replica = open_replica(&config, root).await?;
            let entries = replica.store().list_conflicts(all)?;
            if entries.is_empty() {
                println!("No conflicts");
            }
            for entry in entries {
                let c = &entry.conflict;
                println!(
                    "[{}]{} {} ({}): kept {} from {}, copy {} from {}",
                    entry.id,
                    if entry.acknowledged { " (acked)" } else { "" },
                    c.path,
                    c.reason,
                    c.winner.content_hash.short(),
                    c.winner.device_id,
                    c.copy_path,
                    c.loser.device_id
                );
            }
        }
        Commands::Ack { id } => {
            let config = load_config(cli.config)?;
            let root = config.select_root(cli.root.as_deref())?;
            let replica = open_replica(&config, root).await?;
            if !replica.store().acknowledge_conflict(id)? {
                bail!("No conflict with id {}", id);
            }
            println!("Conflict {} acknowledged", id);
        }
        Commands::Sync { address } => {
            let config = load_config(cli.config)?;
            let root = config.select_root(cli.root.as_deref())?;
            let replica = open_replica(&config, root).await?;
            replica.indexer().scan().await.context("Scan failed")?;
            let scheduler = build_scheduler(&config, root, replica).await?;
            let report = scheduler.sync_once(&address).await?;
            println!(
                "Synced with {}: {} fetched, {} pushed, {} deleted, {} merged, {} conflicts",
                report.peer_device, report.fetched, report.pushed, report.deleted, report.merged, report.conflicts
            );
            for path in &report.failed {
                println!("  failed: {}", path);
            }
            for path in &report.requeued {
                println!("  re-queued: {}", path);
            }
        }
    }

    Ok(())
}
