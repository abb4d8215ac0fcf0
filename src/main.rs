use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use proctree::config::{self, ConfigError, try_load_config, try_load_config_from_path};
use proctree::monitor::{Monitor, MonitorOptions};
use proctree::render;
use proctree::system::collector::{HostSockets, HostSource};
use proctree::system::filter::{FilterClass, FilterContext, ProcessFilter, ViewMode};
use proctree::system::snapshot::SystemSnapshot;

/// Gap between the two samples `--once` takes so CPU figures mean something.
const ONCE_SAMPLE_GAP: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "proctree",
    about = "Live process inspector with hierarchy-preserving search and socket decoding"
)]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Refresh rate in milliseconds
    #[arg(long)]
    refresh_rate: Option<u64>,

    /// Flat list sorted by name instead of the process tree
    #[arg(long, default_value_t = false)]
    flat: bool,

    /// Filter class: all, mine, others, apps, services
    #[arg(long)]
    filter: Option<String>,

    /// Case-insensitive search over name, command path and pid
    #[arg(long, default_value = "")]
    search: String,

    /// Print one view after a second sample and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Print the decoded network connections of one process and exit
    #[arg(long, value_name = "PID")]
    connections: Option<u32>,

    /// Emit JSON instead of text tables
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Write logs to stderr as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let (config, config_error) = load_config_for_cli(&cli);
    init_tracing(&config.general.log_level, cli.log_json)?;
    if let Some(err) = config_error {
        tracing::warn!(error = %err, "using default config");
    }

    let mut source = HostSource::new();
    let context = FilterContext {
        current_user: source.current_user(),
        application_marker: config.filters.application_path_marker.clone(),
    };
    let view = if cli.flat {
        ViewMode::Flat
    } else {
        ViewMode::from_str_config(&config.general.default_view)
    };
    let filter = ProcessFilter::new(
        FilterClass::from_str_config(&config.general.default_filter),
        cli.search.clone(),
    );

    let mut options = MonitorOptions::from_config(&config);
    // A single lookup has no use for per-refresh counts.
    if cli.connections.is_some() {
        options.count_connections = false;
    }
    let monitor = Monitor::start(source, Arc::new(HostSockets), context, options);

    if let Some(pid) = cli.connections {
        let result = print_connections(&monitor, pid, cli.json).await;
        monitor.stop();
        return result;
    }

    let mut snapshots = monitor.subscribe();
    if cli.once {
        let first = next_snapshot(&mut snapshots).await?;
        tracing::debug!(sequence = first.sequence, "baseline sample taken");
        tokio::time::sleep(ONCE_SAMPLE_GAP).await;
        monitor.refresh_now();
        let snapshot = next_snapshot(&mut snapshots).await?;
        print_view(&snapshot, &filter, view, cli.json)?;
        monitor.stop();
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = next_snapshot(&mut snapshots) => {
                let snapshot = snapshot?;
                print_view(&snapshot, &filter, view, cli.json)?;
            }
        }
    }
    monitor.stop();
    Ok(())
}

/// Runs before the subscriber exists, so a bad config file is handed back to
/// be logged once tracing is up.
fn load_config_for_cli(cli: &Cli) -> (config::Config, Option<ConfigError>) {
    let loaded = match &cli.config {
        Some(path) => try_load_config_from_path(path),
        None => try_load_config(),
    };
    let (mut config, error) = match loaded {
        Ok(config) => (config, None),
        Err(err) => (config::Config::default(), Some(err)),
    };

    if let Some(rate) = cli.refresh_rate {
        config.general.refresh_interval_ms = rate;
    }
    if let Some(ref filter) = cli.filter {
        config.general.default_filter = filter.clone();
    }

    (config, error)
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err_with(|| format!("invalid log level `{level}`"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| eyre!(e))
}

async fn next_snapshot(
    snapshots: &mut watch::Receiver<Arc<SystemSnapshot>>,
) -> Result<Arc<SystemSnapshot>> {
    snapshots
        .changed()
        .await
        .map_err(|_| eyre!("monitor stopped before publishing a snapshot"))?;
    Ok(Arc::clone(&snapshots.borrow_and_update()))
}

fn print_view(
    snapshot: &SystemSnapshot,
    filter: &ProcessFilter,
    view: ViewMode,
    json: bool,
) -> Result<()> {
    match (view, json) {
        (ViewMode::Tree, false) => {
            println!("{}", render::render_counts(&snapshot.counts, filter.class));
            print!("{}", render::render_tree(&snapshot.tree_view(filter)));
        }
        (ViewMode::Flat, false) => {
            println!("{}", render::render_counts(&snapshot.counts, filter.class));
            print!("{}", render::render_flat(&snapshot.flat_view(filter)));
        }
        (ViewMode::Tree, true) => {
            println!("{}", serde_json::to_string(&snapshot.tree_view(filter))?);
        }
        (ViewMode::Flat, true) => {
            println!("{}", serde_json::to_string(&snapshot.flat_view(filter))?);
        }
    }
    Ok(())
}

async fn print_connections(monitor: &Monitor, pid: u32, json: bool) -> Result<()> {
    let records = monitor.connections(pid).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", render::render_connections(pid, &records));
    }
    Ok(())
}
