//! steep-repl - PostgreSQL Node Initialization Daemon
//!
//! Provisions replica nodes from a source snapshot and keeps them caught
//! up until synchronized.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steep_repl::api::HttpServer;
use steep_repl::config::{CatchupConfig, InitializationConfig, LoggingConfig, SteepConfig};
use steep_repl::error::Result;
use steep_repl::executor::{MemoryCluster, PostgresConnector};
use steep_repl::lifecycle::InitManager;
use steep_repl::model::InitState;
use steep_repl::progress::InitProgress;
use steep_repl::snapshot::format_ratio;
use steep_repl::state::StateStore;
use steep_repl::tuning;

/// steep-repl - PostgreSQL Node Initialization Daemon
#[derive(Parser)]
#[command(name = "steep-repl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "steep.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon for the configured node
    Run,

    /// Provision an in-memory replica and print progress until synchronized
    Demo {
        /// Number of tables on the demo source
        #[arg(long, default_value_t = 4)]
        tables: usize,

        /// Rows per table
        #[arg(long, default_value_t = 2000)]
        rows: usize,

        /// Snapshot workers
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Write a new configuration file
    InitConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "steep.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config may not exist yet (init-config, demo); fall back to defaults
    let logging = SteepConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging)?;

    match cli.command {
        Commands::Run => run_daemon(cli.config).await,
        Commands::Demo { tables, rows, workers } => run_demo(tables, rows, workers).await,
        Commands::InitConfig { output, node_id } => run_init_config(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init(),
    }
    Ok(())
}

/// Run the daemon
async fn run_daemon(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting steep-repl...");

    let config = match SteepConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.state_dir()) {
        tracing::error!("Failed to create state directory {:?}: {}", config.state_dir(), e);
        return Err(e.into());
    }
    let store = Arc::new(StateStore::open(&config.state_dir())?);

    let workers = config.initialization.effective_workers();
    tracing::info!(
        workers = workers,
        chunk_size = %config.initialization.chunk_size,
        compression = config.initialization.compression,
        peers = config.peers.len(),
        "Snapshot settings"
    );

    let connector = Arc::new(PostgresConnector::from_config(&config));
    let manager = Arc::new(
        InitManager::new(
            connector,
            config.initialization.clone(),
            config.catchup.clone(),
        )
        .with_store(store),
    );
    manager.restore().await?;
    manager.register_node(&config.node.id, config.node_name()).await?;

    let http = HttpServer::new(config.api.clone(), config.node.id.clone(), Arc::clone(&manager));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http.start().await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    manager.shutdown().await;
    http_handle.abort();
    tracing::info!("steep-repl shutdown complete");
    Ok(())
}

/// Provision an in-memory replica, printing progress as it goes
async fn run_demo(tables: usize, rows: usize, workers: usize) -> Result<()> {
    let cluster = Arc::new(MemoryCluster::new());
    let primary = cluster.add_node("primary").await;
    cluster.add_node("replica").await;

    let mut parent: Option<String> = None;
    for t in 0..tables.max(1) {
        let name = format!("table_{:02}", t);
        let qualified = format!("public.{}", name);
        let depends: Vec<&str> = parent.as_deref().into_iter().collect();
        primary.create_table("public", &name, &depends).await;
        // later tables are larger so the weighting is visible
        let count = rows * (t + 1);
        primary
            .insert_rows(&qualified, (0..count).map(|i| format!("{}\t{}\tpayload-{:06}", i, name, i)))
            .await?;
        primary.set_sequence(&format!("public.{}_id_seq", name), count as i64).await;
        parent = Some(qualified);
    }

    let init = InitializationConfig {
        parallel_workers: workers,
        chunk_size: "16KB".into(),
        sample_interval_ms: 200,
        ..Default::default()
    };
    let catchup = CatchupConfig {
        poll_interval_ms: 100,
        ..Default::default()
    };
    let manager = InitManager::new(cluster.clone(), init, catchup);
    let handle = manager.register_node("replica", "Demo Replica").await?;
    primary.set_read_delay(Duration::from_millis(10)).await;

    println!("Provisioning demo replica from in-memory primary");
    println!("{}", tuning::tuning_summary(&tuning::auto_tune()));
    println!();
    manager.start_init("replica", "primary").await?;

    let mut rx = handle.subscribe();
    let mut wrote_late = false;
    loop {
        let status = Arc::clone(&rx.borrow_and_update());
        print_progress_line(&status.progress);

        // writes during the copy arrive through catch-up
        if !wrote_late && status.record.state == InitState::Copying {
            primary.insert_rows("public.table_00", ["late\tdemo\twritten-during-copy"]).await?;
            wrote_late = true;
        }

        if status.record.state.is_terminal() {
            println!();
            match status.record.state {
                InitState::Synchronized => println!("✓ Replica synchronized"),
                state => println!("✗ Replica ended {}: {:?}", state, status.record.last_error),
            }
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
    Ok(())
}

fn print_progress_line(p: &InitProgress) {
    let eta = p
        .eta_seconds
        .map(|s| format!("{}s", s))
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{:<14} {:>6.2}%  tables {}/{}  {:<22} {:>10.0} B/s  eta {:<8} ratio {}  checksums {}/{}",
        p.state.as_str(),
        p.overall_percent,
        p.tables_completed,
        p.tables_total,
        p.current_table.as_deref().unwrap_or("-"),
        p.throughput_bytes_per_sec,
        eta,
        format_ratio(p.compression_ratio),
        p.checksums_verified,
        p.checksums_total,
    );
}

/// Write a configuration file
fn run_init_config(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# steep-repl Configuration
# Generated configuration file

[node]
id = "{node_id}"
name = "{node_id}"
data_dir = "/var/lib/steep/{node_id}"

# The local PostgreSQL instance this node provisions
[postgresql]
host = "localhost"
port = 5432
user = "steep"
password = "changeme"
database = "postgres"
pool_size = 10
connect_timeout_secs = 30

# Nodes that can serve as snapshot sources
# [[peers]]
# id = "node-0"
# host = "primary.example.com"
# port = 5432
# user = "steep"
# password = "changeme"
# database = "postgres"

[initialization]
parallel_workers = 0        # 0 = auto-tune from CPU cores
chunk_size = "8MB"
compression = true
chunk_retries = 3
chunk_timeout_secs = 300
retry_backoff_ms = 500
checksum_retries = 3
schema_sync = "strict"      # strict, auto or manual
cancel_grace_secs = 30
progress_window = 60
sample_interval_ms = 1000

[catchup]
poll_interval_ms = 2000
max_lag_bytes = 1048576
lag_alert_secs = 300
max_poll_failures = 10

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
# file = "/var/log/steep/steep-repl.log"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your PostgreSQL connection and peers.");
    println!("Then start with: steep-repl --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match SteepConfig::from_file(&config_path) {
        Ok(config) => {
            print_config_summary(&config, &config_path);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn print_config_summary(config: &SteepConfig, path: &Path) {
    println!("✓ Configuration is valid ({})", path.display());
    println!("  Node:           {} ({})", config.node.id, config.node_name());
    println!("  Data Directory: {}", config.data_dir().display());
    println!(
        "  PostgreSQL:     {}@{}:{}/{}",
        config.postgresql.user, config.postgresql.host, config.postgresql.port, config.postgresql.database
    );
    println!("  Peers:          {}", config.peers.len());
    for peer in &config.peers {
        println!(
            "    - {} ({}:{}/{})",
            peer.id, peer.postgresql.host, peer.postgresql.port, peer.postgresql.database
        );
    }
    println!("  Workers:        {}", config.initialization.effective_workers());
    println!("  Chunk Size:     {}", config.initialization.chunk_size);
    println!("  Compression:    {}", config.initialization.compression);
    println!("  API:            {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });
}
