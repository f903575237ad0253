//! fastread daemon and operator CLI.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use fastread::clock::SystemClock;
use fastread::config::Config;
use fastread::engine::Engine;
use fastread::llm::openai::OpenAiClient;
use fastread::mail::gmail::{GmailStore, TokenManager};
use fastread::runtime::run_trigger_loop;
use fastread::store::{FileBlobStore, SqliteKv};
use fastread::trigger::{InMemoryTriggers, DEFAULT_TRIGGER_BUDGET};
use fastread::types::RunStatus;

/// LLM-assisted email triage.
#[derive(Parser)]
#[command(name = "fastread")]
#[command(about = "Scans your inbox, classifies what matters, and sends a daily digest")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the triage daemon (hourly passive scans + daily digest).
    Run,

    /// Start an active scan over a historical range (e.g. `7days`) and
    /// follow it to completion.
    Scan {
        /// Symbolic range: 1day, 3days, 7days, 30days, ...
        range: String,
    },

    /// Show the latest run stats and the engine's persisted state.
    Status,
}

fn build_engine() -> Result<(Arc<Engine>, Arc<InMemoryTriggers>)> {
    let config = Config::load().context("loading ~/.fastread/config.json")?;

    let kv = Arc::new(SqliteKv::open().context("opening state database")?);
    let blobs = Arc::new(FileBlobStore::open().context("opening blob directory")?);
    let gmail = Arc::new(GmailStore::new(TokenManager::new()));
    let llm = Arc::new(OpenAiClient::from_config(&config).context("building LLM client")?);
    let clock = Arc::new(SystemClock);
    let triggers = Arc::new(InMemoryTriggers::new(clock.clone(), DEFAULT_TRIGGER_BUDGET));

    let engine = Engine::new(
        config,
        kv,
        blobs,
        gmail.clone(),
        llm,
        triggers.clone(),
        gmail,
        clock,
    );
    Ok((Arc::new(engine), triggers))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let (engine, triggers) = build_engine()?;
            log::info!("fastread daemon starting");
            run_trigger_loop(engine, triggers).await;
            Ok(())
        }

        Commands::Scan { range } => {
            let (engine, triggers) = build_engine()?;
            engine.start_active_scan(&range).await?;
            println!("Scan over {range} started.");

            // Drive the trigger loop until the run reaches a terminal
            // state, then report it.
            let loop_engine = engine.clone();
            let driver = tokio::spawn(run_trigger_loop(loop_engine, triggers));
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                match engine.state().status()? {
                    Some(RunStatus::Running) | None => continue,
                    Some(terminal) => {
                        driver.abort();
                        let msg = engine.state().status_msg()?.unwrap_or_default();
                        println!("{terminal}: {msg}");
                        if terminal != RunStatus::Completed {
                            bail!("scan ended in state '{terminal}'");
                        }
                        return Ok(());
                    }
                }
            }
        }

        Commands::Status => {
            let (engine, _triggers) = build_engine()?;
            let state = engine.state();

            match state.status()? {
                Some(status) => println!("status:    {status}"),
                None => println!("status:    (no run recorded)"),
            }
            if let Some(msg) = state.status_msg()? {
                println!("message:   {msg}");
            }
            if let Some(cursor) = state.chunk_cursor()? {
                println!(
                    "progress:  chunk {}/{} over [{}, {})",
                    cursor.index, cursor.total, cursor.window_start, cursor.window_end
                );
            }
            let (last_ts, last_id) = state.passive_cursor()?;
            if let Some(ts) = last_ts {
                println!(
                    "passive:   high-water {} ({})",
                    ts,
                    last_id.unwrap_or_default()
                );
            }
            if let Some(date) = state.passive_last_summary_date()? {
                println!("digest:    last sent {date}");
            }
            if let Some(stats) = state.latest_run_stats()? {
                println!(
                    "last run:  {} over {}: {} threads, {} must-do, {} must-know ({})",
                    stats.status,
                    stats.time_range,
                    stats.threads_processed,
                    stats.must_do,
                    stats.must_know,
                    stats.message
                );
            }
            Ok(())
        }
    }
}
