use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use headwatch::config::LoggingConfig;
use headwatch::state::{JournalEntry, Severity};
use headwatch::{read_snapshot, Config, EventJournal, EventType, SyncStatus, Watcher};

#[derive(Parser)]
#[command(name = "headwatch")]
#[command(about = "Repository head watcher that drives a reindex pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the repository in the foreground and print each status change
    Watch {
        /// Print statuses as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Read and print the current head snapshot once
    Snapshot {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recent journal entries
    History {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,

        /// Only show one kind of entry (e.g. branch_switch, scan_failed)
        #[arg(long = "type")]
        event_type: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Repository root to watch
        #[arg(short, long, default_value = ".")]
        root: String,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config_for(&cli)?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting headwatch v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Watch { json } => cmd_watch(json, &config).await,
        Commands::Snapshot { json } => cmd_snapshot(json, &config),
        Commands::History { limit, event_type } => cmd_history(limit, event_type, &config),
        Commands::Init { root, force } => cmd_init(root, force, cli.config.as_deref()),
        Commands::Config => cmd_config(&config, cli.config.as_deref()),
    }
}

/// Initialize logging based on verbosity level and configured format.
///
/// Logs go to stderr so `watch --json` output stays machine readable.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let layer = match logging.format.as_str() {
        "json" => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        "pretty" => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        "compact" => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
        other => return Err(anyhow!("Unknown logging.format '{}'", other)),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    Ok(())
}

/// Configuration for the chosen command. `init` creates the file, so it
/// starts from defaults instead of reading it.
fn config_for(cli: &Cli) -> Result<Config> {
    match cli.command {
        Commands::Init { .. } => Ok(Config::default()),
        _ => load_config(cli.config.as_deref()),
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Run the watcher until Ctrl+C
async fn cmd_watch(json: bool, config: &Config) -> Result<()> {
    let watcher = Watcher::from_config(config)?;
    let (mut handle, report) = watcher.start();

    for failure in &report.failures {
        eprintln!("⚠️  {}", failure);
    }
    if !json {
        println!(
            "👀 Watching {} (Ctrl+C to stop)",
            config.repository_root()?.display()
        );
        if !report.push_active() {
            println!("   Change notifications unavailable, polling only");
        }
    }

    loop {
        tokio::select! {
            status = handle.next_status() => match status {
                Some(status) => print_status(&status, json)?,
                None => break,
            },

            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                info!("Shutdown signal received, stopping watcher...");
                break;
            }
        }
    }

    let stats = handle.stats();
    handle.dispose().await;

    if !json {
        println!(
            "✅ Stopped after {} triggers ({} discarded), {} scans ({} failed)",
            stats.triggers_received, stats.triggers_discarded, stats.scans_started, stats.scans_failed
        );
    }

    Ok(())
}

fn print_status(status: &SyncStatus, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(status).context("Failed to serialize status")?
        );
        return Ok(());
    }

    let icon = match status {
        SyncStatus::Idle { .. } => "💤",
        SyncStatus::Scanning { .. } => "🔄",
        SyncStatus::Watching(_) => "✅",
        SyncStatus::Error { .. } => "❌",
    };
    println!("{} {}", icon, status);
    Ok(())
}

/// Print the current head snapshot
fn cmd_snapshot(json: bool, config: &Config) -> Result<()> {
    let root = config.repository_root()?;
    let snapshot = read_snapshot(&root)
        .with_context(|| format!("Failed to read head state of {}", root.display()))?;

    if json {
        println!("{}", serde_json::to_string(&snapshot)?);
        return Ok(());
    }

    match snapshot.branch() {
        Some(branch) => println!("📍 {} at {}", branch, snapshot.revision()),
        None => println!("📍 detached HEAD at {}", snapshot.revision()),
    }
    Ok(())
}

/// Show recent journal entries
fn cmd_history(limit: u32, event_type: Option<String>, config: &Config) -> Result<()> {
    if !config.journal.enabled {
        println!("⚠️  Journal is disabled (journal.enabled: false)");
        return Ok(());
    }

    let filter = event_type
        .map(|name| {
            EventType::parse(&name).ok_or_else(|| {
                anyhow!(
                    "Unknown event type '{}'. Expected one of: branch_switch, revision_advance, \
                     detached_entered, detached_recovered, scan_completed, scan_failed",
                    name
                )
            })
        })
        .transpose()?;

    let journal = EventJournal::open_at(Path::new(&config.journal.path))?;
    let entries = journal.recent(filter, limit)?;

    if entries.is_empty() {
        println!("No journal entries yet");
        return Ok(());
    }

    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

fn print_entry(entry: &JournalEntry) {
    let icon = match entry.severity {
        Severity::Info => "ℹ️ ",
        Severity::Warning => "⚠️ ",
        Severity::Error => "❌",
    };
    let revision = entry
        .revision
        .as_deref()
        .map(|r| r.get(..7).unwrap_or(r))
        .unwrap_or("-");
    println!(
        "{} {}  {:<18} {:<24} {}  {}",
        icon,
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.event_type.as_str(),
        entry.branch.as_deref().unwrap_or("(detached)"),
        revision,
        entry.summary
    );
}

/// Write a default configuration file
fn cmd_init(root: String, force: bool, config_path: Option<&Path>) -> Result<()> {
    info!("Initializing headwatch...");

    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    if config_path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", config_path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    let mut config = Config::default();
    config.repository.root = root;
    config.save(&config_path)?;

    println!("✅ headwatch initialized");
    println!("   Config: {}", config_path.display());
    println!("   Repository: {}", config.repository.root);
    println!("   Next: set scan.command, then run 'headwatch watch'");

    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };
    println!("# {}", path.display());
    print!(
        "{}",
        serde_yaml::to_string(config).context("Failed to serialize configuration")?
    );
    Ok(())
}
