//! eventctl: operator commands for dead letters and the outbox
//!
//! Every command prints one JSON object per line on stdout so the output can
//! be piped into `jq`. Logs go to stderr.

mod output;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use event_bus::dlq::{self, DeadLetterFilter, DeadLetterSink, PgDeadLetterSink};
use event_bus::outbox::{OutboxQueue, PgOutboxStore};
use event_bus::NatsBus;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "eventctl")]
#[command(about = "Inspect and repair the event outbox and dead letters")]
struct Cli {
    /// Postgres holding events_outbox and dead_letter_records
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dead-letter records
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Outbox maintenance
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    /// List dead letters, oldest failure first
    List {
        #[arg(long)]
        topic: Option<String>,

        /// Earliest first failure, RFC 3339 (inclusive)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Latest first failure, RFC 3339 (exclusive)
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        #[arg(long)]
        include_resolved: bool,

        #[arg(long, default_value = "100")]
        limit: i64,
    },
    /// Re-publish a dead letter to its original topic and mark it resolved
    Replay {
        id: Uuid,

        #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
        nats_url: String,
    },
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
    /// Unprocessed entries that exhausted their publish retries
    Stalled {
        #[arg(long, env = "RELAY_MAX_RETRIES", default_value = "5")]
        max_retries: i32,
    },
    /// Delete processed entries older than the given age
    Purge {
        #[arg(long)]
        older_than_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&cli.database_url)
        .await
        .context("failed to connect to database")?;

    let result = run(cli.command, &pool).await;
    pool.close().await;
    result
}

async fn run(command: Command, pool: &PgPool) -> Result<()> {
    tracing::debug!(command = ?command, "Running command");
    match command {
        Command::Dlq { command } => run_dlq(command, pool).await,
        Command::Outbox { command } => run_outbox(command, pool).await,
    }
}

async fn run_dlq(command: DlqCommand, pool: &PgPool) -> Result<()> {
    let sink = PgDeadLetterSink::new(pool.clone());

    match command {
        DlqCommand::List {
            topic,
            from,
            to,
            include_resolved,
            limit,
        } => {
            if limit <= 0 {
                bail!("--limit must be positive");
            }
            let filter = DeadLetterFilter {
                topic,
                from,
                to,
                include_resolved,
                limit: Some(limit),
            };
            for record in sink.list(&filter).await? {
                println!("{}", output::dead_letter(&record));
            }
        }
        DlqCommand::Replay { id, nats_url } => {
            let client = async_nats::connect(&nats_url)
                .await
                .with_context(|| format!("failed to connect to NATS at {}", nats_url))?;
            let bus = NatsBus::new(client);

            let outcome = dlq::replay(&sink, &bus, id)
                .await
                .with_context(|| format!("replay of dead letter {} failed", id))?;
            println!("{}", output::replay(&outcome));
        }
    }
    Ok(())
}

async fn run_outbox(command: OutboxCommand, pool: &PgPool) -> Result<()> {
    let store = PgOutboxStore::new(pool.clone());

    match command {
        OutboxCommand::Stalled { max_retries } => {
            for entry in store.stalled(max_retries).await? {
                println!("{}", output::outbox_entry(&entry));
            }
        }
        OutboxCommand::Purge { older_than_hours } => {
            if older_than_hours < 0 {
                bail!("--older-than-hours cannot be negative");
            }
            let before = Utc::now() - ChronoDuration::hours(older_than_hours);
            let deleted = store.purge_processed(before).await?;
            println!("{}", serde_json::json!({ "purged": deleted, "before": before }));
        }
    }
    Ok(())
}
