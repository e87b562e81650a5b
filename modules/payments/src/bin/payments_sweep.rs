//! Payments maintenance sweeps
//!
//! Runs one sweep against the database and exits. Safe to run while the
//! service is up: every sweep locks its batches with `SKIP LOCKED`.
//!
//! # Usage
//! ```bash
//! payments_sweep expire-intents [--batch 100]
//! payments_sweep expire-subscriptions [--batch 100]
//! payments_sweep send-reminders [--batch 100]
//! payments_sweep cleanup-intents [--batch 100] [--retention-days 90]
//! payments_sweep reconcile-ledger [--batch 100]
//! ```

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use event_bus::InMemoryBus;
use sqlx::postgres::PgPoolOptions;

use payments_core_rs::config::Config;
use payments_core_rs::events::{PaymentBus, SOURCE_MODULE};
use payments_core_rs::gateway::PaymentGatewayManager;
use payments_core_rs::store::{PaymentStore, PgStore};
use payments_core_rs::PaymentsContext;

#[derive(Parser, Debug)]
#[command(name = "payments_sweep")]
#[command(about = "Run one payments maintenance sweep and exit", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Rows per batch (default: SWEEP_BATCH_SIZE)
    #[arg(long, global = true, env = "SWEEP_BATCH_SIZE", value_parser = clap::value_parser!(i64).range(1..))]
    batch: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cancel intents and payments past their expiry
    ExpireIntents,
    /// Move lapsed subscriptions into grace or expired
    ExpireSubscriptions,
    /// Announce subscriptions approaching their period end
    SendReminders,
    /// Delete terminal intents older than the retention window
    CleanupIntents {
        /// Retention in days (default: INTENT_RETENTION_DAYS)
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        retention_days: Option<i64>,
    },
    /// Post ledger entries missing for captured payments and settled refunds
    ReconcileLedger,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!(error = %format!("{:#}", e), "Sweep failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn PaymentStore> = Arc::new(PgStore::new(pool));
    let gateways = Arc::new(PaymentGatewayManager::from_config(&config)?);
    let bus: PaymentBus = Arc::new(InMemoryBus::new(SOURCE_MODULE));
    let context = PaymentsContext::new(&config, store, gateways, bus, None)?;

    let batch = args.batch.unwrap_or(config.sweep_batch_size);
    let now = Utc::now();

    match args.command {
        Command::ExpireIntents => {
            let summary = context.payments.expire_due_intents(now, batch).await?;
            let stale = context.payments.expire_stale_payments(now, batch).await?;
            tracing::info!(
                intents_cancelled = summary.intents_cancelled,
                payments_cancelled = summary.payments_cancelled + stale,
                "Intent expiry finished"
            );
        }
        Command::ExpireSubscriptions => {
            let transitions = context.subscriptions.expire_due(now, batch).await?;
            tracing::info!(transitions, "Subscription expiry finished");
        }
        Command::SendReminders => {
            let sent = context.subscriptions.send_renewal_reminders(now, batch).await?;
            tracing::info!(sent, "Renewal reminders finished");
        }
        Command::CleanupIntents { retention_days } => {
            let retention = retention_days
                .map(Duration::days)
                .unwrap_or(config.intent_retention);
            let summary = context.cleanup.cleanup_stale(now, retention, batch).await?;
            tracing::info!(
                intents_deleted = summary.intents_deleted,
                payments_deleted = summary.payments_deleted,
                "Cleanup finished"
            );
        }
        Command::ReconcileLedger => {
            let summary = context.ledger.reconcile(batch).await?;
            tracing::info!(
                capture_entries = summary.capture_entries,
                refund_entries = summary.refund_entries,
                failures = summary.failures,
                "Ledger reconciliation finished"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_subcommands_and_flags() {
        let args = Args::try_parse_from([
            "payments_sweep",
            "cleanup-intents",
            "--retention-days",
            "30",
            "--batch",
            "50",
        ])
        .unwrap();
        assert_eq!(args.batch, Some(50));
        assert!(matches!(
            args.command,
            Command::CleanupIntents {
                retention_days: Some(30)
            }
        ));

        let args = Args::try_parse_from(["payments_sweep", "reconcile-ledger"]).unwrap();
        assert!(matches!(args.command, Command::ReconcileLedger));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Args::try_parse_from(["payments_sweep"]).is_err());
        assert!(Args::try_parse_from(["payments_sweep", "expire-intents", "--batch", "0"]).is_err());
        assert!(Args::try_parse_from(["payments_sweep", "send-reminders", "--retention-days", "5"]).is_err());
    }
}
