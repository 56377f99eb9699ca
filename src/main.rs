use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use inbound_mail::config::IngestConfig;
use inbound_mail::queue::{LruDedupGate, Poller, ProcessorSettings, QueueProcessor, SystemClock};
use inbound_mail::responder::{ResponderConfig, create_responder};
use inbound_mail::store::LibSqlBackend;
use inbound_mail::webhook::webhook_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let _log_guard = init_tracing(&config)?;

    eprintln!("📬 Inbound Mail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhooks/inbound", config.http_port);
    eprintln!("   Queue API: http://0.0.0.0:{}/api/queue/stats", config.http_port);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Poll: every {}s, {} attempts max\n",
        config.poll_interval.as_secs(),
        config.max_attempts
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Responder ────────────────────────────────────────────────────────
    let responder_config = ResponderConfig::from_env()?;
    let responder = create_responder(&responder_config)?;

    // ── Queue processing ─────────────────────────────────────────────────
    let dedup = Arc::new(LruDedupGate::new(config.dedup_capacity, config.dedup_ttl));
    let processor = Arc::new(QueueProcessor::new(
        db.clone(),
        db.clone(),
        responder,
        dedup,
        ProcessorSettings::from(&config),
    ));
    let poller = Poller::new(processor, Arc::new(SystemClock), config.poll_interval).start();

    // ── Webhook server ───────────────────────────────────────────────────
    let app = webhook_routes(db);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Webhook server failed")?;

    poller.stop().await;
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(config: &IngestConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "inbound-mail.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    Ok(guard)
}
