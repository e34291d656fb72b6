use anyhow::Context;
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use remind_relay::{Relay, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("Invalid relay configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📨 Remind Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.server.port);
    eprintln!("   Gateway: {}", config.gateway.endpoint);
    eprintln!("   Data: {}", config.server.data_file.display());
    eprintln!(
        "   Quiet hours: {:02}:00-{:02}:00 {}",
        config.quiet_hours.start_hour, config.quiet_hours.end_hour, config.quiet_hours.timezone
    );
    eprintln!(
        "   Breaker: {} failures, {}s cooldown",
        config.breaker.failure_threshold,
        config.breaker.cooldown.as_secs()
    );
    if config.webhook_secret.expose_secret().is_empty() {
        eprintln!("   Warning: GATEWAY_WEBHOOK_SECRET not set, all webhooks will be rejected");
    }

    let relay = Relay::build(&config)
        .await
        .context("Failed to start relay")?;

    // ── Scheduler ───────────────────────────────────────────────────────
    let scheduler = relay.spawn_scheduler();
    eprintln!("   Scheduler: every {}s\n", config.scheduler_interval.as_secs());

    // ── HTTP ────────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "Relay HTTP server started");

    axum::serve(listener, relay.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    relay.shutdown(scheduler).await?;
    Ok(())
}

fn init_tracing(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "remind-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
