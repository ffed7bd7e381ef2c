//! steepctl - Command line tool for steep-repl node initialization
//!
//! Usage:
//!   steepctl list                        - Show every node's state
//!   steepctl status <node>               - Show one node's progress
//!   steepctl start <node> --source <id>  - Begin initialization
//!   steepctl cancel <node>               - Cancel a running initialization
//!   steepctl reinit <node>               - Reinitialize a failed or diverged node
//!   steepctl watch <node>                - Live progress view

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// steep-repl Control Tool
#[derive(Parser)]
#[command(name = "steepctl")]
#[command(about = "Control and monitor steep-repl node initialization", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/steep/steep.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nodes and their initialization state
    List,
    /// Show initialization progress of a node
    Status {
        node: String,
    },
    /// Start initializing a node from a source node
    Start {
        node: String,
        /// Node to copy the snapshot from
        #[arg(long)]
        source: String,
    },
    /// Cancel a running initialization
    Cancel {
        node: String,
    },
    /// Discard the previous attempt and initialize again
    Reinit {
        node: String,
    },
    /// Show the lifecycle transition history of a node
    History {
        node: String,
    },
    /// Show live progress (updates every second, Ctrl+C to exit)
    Watch {
        node: String,
    },
}

// ============ API Response Types ============

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct Progress {
    node_id: String,
    #[serde(default)]
    node_name: String,
    state: String,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    current_step: Option<String>,
    #[serde(default)]
    overall_percent: f64,
    #[serde(default)]
    tables_total: usize,
    #[serde(default)]
    tables_completed: usize,
    #[serde(default)]
    current_table: Option<String>,
    #[serde(default)]
    current_table_percent: f64,
    #[serde(default)]
    rows_copied: u64,
    #[serde(default)]
    bytes_copied: u64,
    #[serde(default)]
    throughput_bytes_per_sec: f64,
    #[serde(default)]
    throughput_rows_per_sec: f64,
    #[serde(default)]
    eta_seconds: Option<u64>,
    #[serde(default)]
    parallel_workers: usize,
    #[serde(default)]
    compression_ratio: Option<f64>,
    #[serde(default)]
    checksums_total: usize,
    #[serde(default)]
    checksums_verified: usize,
    #[serde(default)]
    checksums_failed: usize,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    source_node: Option<String>,
    #[serde(default)]
    lag_bytes: Option<u64>,
    #[serde(default)]
    throughput_history: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct Transition {
    from: String,
    to: String,
    #[serde(default)]
    reason: Option<String>,
    at: String,
}

#[derive(Debug, Deserialize)]
struct ControlResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

// Config file structure (minimal, for reading API address)
#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

type CmdResult = anyhow::Result<()>;

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::List => list_nodes(&client, &endpoint).await,
        Commands::Status { node } => show_status(&client, &endpoint, node).await,
        Commands::Start { node, source } => {
            let body = serde_json::json!({ "source": source });
            control(&client, &endpoint, node, "init", Some(body)).await
        }
        Commands::Cancel { node } => control(&client, &endpoint, node, "cancel", None).await,
        Commands::Reinit { node } => control(&client, &endpoint, node, "reinit", None).await,
        Commands::History { node } => show_history(&client, &endpoint, node).await,
        Commands::Watch { node } => watch(&client, &endpoint, node).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Derive the API URL from the daemon's config, defaulting to localhost:8080
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|c| c.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // Convert bind address to localhost if it's 0.0.0.0
    if addr.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
    } else {
        format!("http://{}", addr)
    }
}

/// Turn a non-success response into the API's error message
async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(err) => anyhow::bail!("{} ({})", err.error, status),
        Err(_) => anyhow::bail!("API error: {}", status),
    }
}

async fn fetch_progress(
    client: &reqwest::Client,
    endpoint: &str,
    node: &str,
) -> anyhow::Result<Progress> {
    let url = format!("{}/nodes/{}/progress", endpoint, node);
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach steep-repl at {}", endpoint))?;
    Ok(check(response).await?.json().await?)
}

// ============ Commands ============

async fn list_nodes(client: &reqwest::Client, endpoint: &str) -> CmdResult {
    let url = format!("{}/nodes", endpoint);
    let nodes: Vec<Progress> = check(client.get(&url).send().await?).await?.json().await?;

    println!();
    println!("steep-repl Nodes (steepctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("{:<20} {:<16} {:>8} {:<12} {:<10}", "NODE ID", "STATE", "PERCENT", "TABLES", "SOURCE");
    println!("{}", "-".repeat(70));

    for node in &nodes {
        // Pad state to fixed width BEFORE adding color codes
        let state = colored_state(&node.state, 16);
        println!(
            "{:<20} {} {:>7.1}% {:<12} {:<10}",
            node.node_id,
            state,
            node.overall_percent,
            format!("{}/{}", node.tables_completed, node.tables_total),
            node.source_node.as_deref().unwrap_or("-"),
        );
    }
    println!();
    Ok(())
}

async fn show_status(client: &reqwest::Client, endpoint: &str, node: &str) -> CmdResult {
    let p = fetch_progress(client, endpoint, node).await?;

    println!();
    println!("Node:          {} ({})", p.node_id, p.node_name);
    println!("State:         {}", colored_state(&p.state, 0));
    println!("Source:        {}", p.source_node.as_deref().unwrap_or("-"));
    if let Some(phase) = &p.phase {
        println!("Phase:         {} / {}", phase, p.current_step.as_deref().unwrap_or("-"));
    }
    println!("Progress:      {:.1}%", p.overall_percent);
    println!("Tables:        {}/{}", p.tables_completed, p.tables_total);
    if let Some(table) = &p.current_table {
        println!("Current Table: {} ({:.1}%)", table, p.current_table_percent);
    }
    println!("Copied:        {} rows, {}", p.rows_copied, format_bytes(p.bytes_copied as f64));
    println!("Throughput:    {}/s, {:.0} rows/s", format_bytes(p.throughput_bytes_per_sec), p.throughput_rows_per_sec);
    println!("ETA:           {}", format_eta(p.eta_seconds));
    println!("Workers:       {}", p.parallel_workers);
    println!("Compression:   {}", p.compression_ratio.map(|r| format!("{:.2}", r)).unwrap_or_else(|| "N/A".into()));
    println!("Checksums:     {} verified, {} failed, {} total", p.checksums_verified, p.checksums_failed, p.checksums_total);
    if let Some(lag) = p.lag_bytes {
        println!("Lag:           {}", format_bytes(lag as f64));
    }
    if let Some(err) = &p.error_message {
        println!("Error:         \x1b[31m{}\x1b[0m", err);
    }
    println!();
    Ok(())
}

async fn control(
    client: &reqwest::Client,
    endpoint: &str,
    node: &str,
    action: &str,
    body: Option<serde_json::Value>,
) -> CmdResult {
    let url = format!("{}/nodes/{}/{}", endpoint, node, action);
    let request = match body {
        Some(body) => client.post(&url).json(&body),
        None => client.post(&url),
    };
    let response: ControlResponse = check(request.send().await?).await?.json().await?;
    println!("\x1b[32m✓\x1b[0m {}: {}", node, response.message);
    Ok(())
}

async fn show_history(client: &reqwest::Client, endpoint: &str, node: &str) -> CmdResult {
    let url = format!("{}/nodes/{}/transitions", endpoint, node);
    let transitions: Vec<Transition> = check(client.get(&url).send().await?).await?.json().await?;

    if transitions.is_empty() {
        println!("No transitions recorded for {}", node);
        return Ok(());
    }
    println!("{:<32} {:<16} {:<16} REASON", "AT", "FROM", "TO");
    println!("{}", "-".repeat(80));
    for t in &transitions {
        println!("{:<32} {:<16} {:<16} {}", t.at, t.from, t.to, t.reason.as_deref().unwrap_or(""));
    }
    Ok(())
}

async fn watch(client: &reqwest::Client, endpoint: &str, node: &str) -> CmdResult {
    let mut peak: f64 = 1024.0;

    // Hide cursor
    print!("\x1b[?25l");

    loop {
        // Clear screen and move cursor to top
        print!("\x1b[H\x1b[J");
        println!();
        println!("  \x1b[1;36msteep-repl Initialization: {}\x1b[0m", node);
        println!("  {}", "=".repeat(50));
        println!();

        let mut finished = false;
        match fetch_progress(client, endpoint, node).await {
            Ok(p) => {
                println!("  State:     {}", colored_state(&p.state, 0));
                println!("  Progress:  {} {:>5.1}%", progress_bar(p.overall_percent, 30), p.overall_percent);
                println!("  Tables:    {}/{}  {}", p.tables_completed, p.tables_total, p.current_table.as_deref().unwrap_or(""));
                println!("  Rate:      \x1b[1;32m{:>10}/s\x1b[0m", format_bytes(p.throughput_bytes_per_sec));
                println!("  ETA:       {}", format_eta(p.eta_seconds));
                println!("  Checksums: {}/{} ({} failed)", p.checksums_verified, p.checksums_total, p.checksums_failed);
                if let Some(lag) = p.lag_bytes {
                    println!("  Lag:       {}", format_bytes(lag as f64));
                }
                if let Some(err) = &p.error_message {
                    println!("  Error:     \x1b[31m{}\x1b[0m", err);
                }
                println!();

                let current = p.throughput_history.iter().cloned().fold(0.0, f64::max);
                if current > peak {
                    peak = current * 1.2;
                }
                println!("  \x1b[1mThroughput History\x1b[0m");
                draw_ascii_graph(&p.throughput_history, peak);

                finished = matches!(p.state.as_str(), "synchronized" | "failed" | "diverged");
            }
            Err(e) => {
                println!("  \x1b[31mError: {}\x1b[0m", e);
                println!("  Is steep-repl running?");
            }
        }

        println!();
        println!("  \x1b[2mCtrl+C to exit\x1b[0m");
        if finished {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Show cursor again
    print!("\x1b[?25h");
    println!();
    Ok(())
}

// ============ Formatting ============

fn colored_state(state: &str, width: usize) -> String {
    let padded = format!("{:<width$}", state, width = width);
    match state {
        "synchronized" => format!("\x1b[32m{}\x1b[0m", padded),
        "failed" | "diverged" => format!("\x1b[31m{}\x1b[0m", padded),
        "uninitialized" => padded,
        _ => format!("\x1b[33m{}\x1b[0m", padded),
    }
}

fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((percent / 100.0) * width as f64).round() as usize;
    let filled = filled.min(width);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(width - filled))
}

/// Draw an ASCII graph of throughput history
fn draw_ascii_graph(history: &[f64], max_val: f64) {
    let graph_height = 6;
    let graph_width = history.len().max(1);

    for row in (0..graph_height).rev() {
        let threshold = (row as f64 / graph_height as f64) * max_val;

        // Y-axis label
        if row == graph_height - 1 {
            print!("  {:>8} |", format_bytes(max_val));
        } else if row == 0 {
            print!("         0 |");
        } else {
            print!("           |");
        }

        for &val in history {
            if val > 0.0 && val >= threshold {
                print!("\x1b[32m#\x1b[0m");
            } else {
                print!(" ");
            }
        }
        println!("|");
    }

    print!("           +");
    print!("{}", "-".repeat(graph_width));
    println!("+");
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Format an ETA as human-readable string
fn format_eta(secs: Option<u64>) -> String {
    match secs {
        None => "unknown".to_string(),
        Some(secs) if secs >= 3600 => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
        Some(secs) if secs >= 60 => format!("{}m {}s", secs / 60, secs % 60),
        Some(secs) => format!("{}s", secs),
    }
}
