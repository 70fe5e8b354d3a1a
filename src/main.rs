use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::broadcast;

use tg_relay::clock::SystemClock;
use tg_relay::config::RelayConfig;
use tg_relay::{maintenance, shutdown};
use tg_relay::pipeline::{Dispatcher, HistoryScanner};
use tg_relay::platform::{InboundFeed, PlatformClient, TelegramClient};
use tg_relay::rules::{RuleSnapshot, RuleStore};
use tg_relay::session::{SendEngine, SessionPool};
use tg_relay::store::LibSqlBackend;

/// How often unresolved chat references are retried.
const RESOLVE_RETRY_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TG_RELAY_BOT_TOKENS=123456:ABC...,654321:DEF...");
        std::process::exit(1);
    });

    eprintln!("📡 tg-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {}", config.mode);
    eprintln!("   Accounts: {}", config.bot_tokens.len());
    eprintln!("   Rules: {}", config.rules_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Accounts ─────────────────────────────────────────────────────────
    let telegram: Vec<Arc<TelegramClient>> = std::mem::take(&mut config.bot_tokens)
        .into_iter()
        .map(|token| Arc::new(TelegramClient::new(token)))
        .collect();
    let clients: Vec<Arc<dyn PlatformClient>> = telegram
        .iter()
        .map(|c| Arc::clone(c) as Arc<dyn PlatformClient>)
        .collect();
    let pool = Arc::new(
        SessionPool::new(clients, Arc::new(SystemClock))?
            .with_rate_limit_buffer(config.rate_limit_buffer),
    );

    // ── Rules ────────────────────────────────────────────────────────────
    let snapshot = RuleSnapshot::load(&config.rules_path).await?;
    let rules = Arc::new(RuleStore::new(RuleSnapshot::default()));
    let resolver = pool.any_client().await?;
    let report = rules.reload(snapshot, resolver.as_ref()).await;
    eprintln!(
        "   Sources: {} monitored, {} references unresolved",
        rules.current().source_ids().len(),
        report.unresolved.len()
    );

    if !report.is_complete() {
        let rules = Arc::clone(&rules);
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESOLVE_RETRY_INTERVAL);
            // Skip immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(client) = pool.any_client().await else {
                    return;
                };
                if rules.resolve_targets(client.as_ref()).await.is_complete() {
                    tracing::info!("All chat references resolved");
                    return;
                }
            }
        });
    }

    // ── Dispatcher ───────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&rules),
        SendEngine::new(Arc::clone(&pool)),
        db.clone(),
        db.clone(),
        config.dispatch_settings(),
    ));

    let mut events = dispatcher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(
                    source = event.source_chat,
                    message_id = event.message_id,
                    outcome = event.outcome.label(),
                    "Dispatch event"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if config.dedup_enabled {
        let _prune_handle = maintenance::spawn_prune_ticker(
            db.clone(),
            config.prune_schedule.clone(),
            config.dedup_retention_days,
        );
        eprintln!(
            "   Dedup: enabled (retention {} days)",
            config.dedup_retention_days
        );
    } else {
        eprintln!("   Dedup: disabled");
    }

    let shutdown = shutdown::install_signal_handler();

    // ── History ──────────────────────────────────────────────────────────
    let scan = HistoryScanner::new(Arc::clone(&dispatcher), Arc::clone(&pool), config.forward_new_only)
        .with_shutdown(shutdown.clone())
        .scan()
        .await;
    if scan.interrupted {
        tracing::info!("Shutdown requested during history scan");
        return Ok(());
    }

    // ── Live feed ────────────────────────────────────────────────────────
    // Every bot in a channel sees the same posts; one listener is enough.
    let listener = telegram
        .first()
        .context("no accounts configured")?;
    let mut feed = listener.start().await?;
    eprintln!("   Listening as {}\n", listener.account_id());

    loop {
        let unit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested, stopping feed");
                break;
            }
            unit = feed.next() => match unit {
                Some(unit) => unit,
                None => {
                    tracing::info!("Inbound feed ended, shutting down...");
                    break;
                }
            }
        };

        // A unit in flight is finished before the token is checked again.
        dispatcher.process(&unit).await;
    }

    Ok(())
}
