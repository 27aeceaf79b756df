//! Plinko PIR client CLI
//!
//! Usage:
//!   plinko-client query 0xabc... [--plaintext]
//!   plinko-client sync [--watch]
//!   plinko-client info
//!   plinko-client reset-progress

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pir_client::{ClientConfig, HttpSession, PirServer, ProgressStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plinko-client")]
#[command(about = "Private balance lookups against a Plinko PIR server")]
struct Cli {
    #[command(flatten)]
    config: ClientConfig,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up the balance of an address
    Query {
        address: String,

        /// Send the index in the clear (no privacy)
        #[arg(long)]
        plaintext: bool,
    },
    /// Download the hint and apply published deltas
    Sync {
        /// Keep syncing every interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Show server parameters and local sync progress
    Info,
    /// Forget the persisted sync watermark
    ResetProgress,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Query { address, plaintext } => query(&cli.config, &address, plaintext, cli.json).await,
        Command::Sync { watch } => sync(&cli.config, watch, cli.json).await,
        Command::Info => info(&cli.config, cli.json).await,
        Command::ResetProgress => {
            HttpSession::from_config(&cli.config)?.reset_progress()?;
            println!("Sync progress cleared ({})", cli.config.progress_path.display());
            Ok(())
        }
    }
}

async fn query(config: &ClientConfig, address: &str, plaintext: bool, json: bool) -> Result<()> {
    let session = HttpSession::from_config(config)?;

    if plaintext {
        let answer = session.query_balance_plaintext(address).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&answer)?);
        } else {
            println!("Balance: {} (index {}, plaintext)", answer.value, answer.target_index);
        }
        return Ok(());
    }

    session
        .enable_private_mode()
        .await
        .context("private mode unavailable; retry with --plaintext")?;
    if let Some(report) = session.sync_once().await {
        if !report.failed.is_empty() {
            tracing::warn!(failed = ?report.failed, "Some delta blocks could not be applied");
        }
    }
    if let Err(e) = session.verify_server_params().await {
        tracing::warn!(error = %e, "Server parameters do not match the hint");
    }

    let decoded = session.query_balance(address).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&decoded)?);
    } else {
        println!("Balance: {}", decoded.value);
        println!(
            "Set: {} indices, parity server {:#018x} / hint {:#018x}, delta {:#x}",
            decoded.index_set_size, decoded.server_parity, decoded.hint_parity, decoded.delta
        );
        if !decoded.is_consistent() {
            println!("Warning: hint is out of sync with the server");
        }
    }
    Ok(())
}

async fn sync(config: &ClientConfig, watch: bool, json: bool) -> Result<()> {
    let session = HttpSession::from_config(config)?;
    session.enable_private_mode().await?;

    if watch {
        let handle = session.start_sync(config.sync_interval());
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        handle.shutdown().await;
        return Ok(());
    }

    match session.sync_once().await {
        Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Some(report) => {
            println!(
                "Synced blocks {}..={}: {} applied, {} failed, watermark {}",
                report.from,
                report.to,
                report.applied.len(),
                report.failed.len(),
                report.watermark
            );
        }
        None => println!("A sync pass is already running"),
    }
    Ok(())
}

async fn info(config: &ClientConfig, json: bool) -> Result<()> {
    let session = HttpSession::from_config(config)?;
    let health = session
        .engine()
        .server()
        .health()
        .await
        .context("PIR server unreachable")?;
    let progress = config.progress_store().load()?;

    if json {
        let value = serde_json::json!({
            "server": health,
            "progress": progress,
            "pir_server_url": config.pir_server_url,
            "cdn_url": config.cdn_url,
            "hint_checkpoint": config.hint_checkpoint,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Server:     {} ({})", config.pir_server_url, health.status);
        println!("Database:   {} entries", health.db_size);
        println!("Chunks:     {} x {}", health.set_size, health.chunk_size);
        println!("CDN:        {}", config.cdn_url);
        println!("Watermark:  block {}", progress.current_block);
        if progress.has_gap() {
            println!("Applied ahead of gap: {:?}", progress.applied_ahead);
        }
        match &config.hint_checkpoint {
            Some(path) => println!("Checkpoint: {}", path.display()),
            None => println!("Checkpoint: none (hint is downloaded and replayed on start)"),
        }
    }
    Ok(())
}
