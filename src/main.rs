use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use stock_alert_bot::config::{Config, LoggingConfig};
use stock_alert_bot::health::{self, BotStatus, RunState};
use stock_alert_bot::market::{Clock, SystemClock};
use stock_alert_bot::monitor::{Poller, SummaryReporter};
use stock_alert_bot::position::{Position, SharedPosition};
use stock_alert_bot::price;
use stock_alert_bot::storage::DataStore;
use stock_alert_bot::strategy::Strategy;
use stock_alert_bot::telegram::{self, CommandHandler, Notifier, TelegramNotifier, UpdatePoller};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Configuration Error:\n{}\n", e);
            eprintln!("Please check your .env file and ensure all required variables are set correctly.");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.logging)?;

    info!("🚀 Stock Alert Bot - Starting...");
    info!("✅ Configuration loaded");
    info!("   Symbol: {}", config.strategy.symbol);
    info!("   Market: {} {:?} {}-{}", config.market.timezone, config.market.days, config.market.open, config.market.close);
    info!("   Price API: {}", config.price_api.provider);

    let symbol = config.strategy.symbol.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health check server
    let status = BotStatus::new(symbol.clone());
    let health_task = if config.health.enabled {
        let status = status.clone();
        let port = config.health.port;
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(port, status, rx).await {
                error!("Failed to start health check server: {:#}", e);
            }
        }))
    } else {
        info!("Health check server disabled");
        None
    };

    let calendar = config.calendar()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(calendar.timezone()));

    // Position, rehydrated from storage
    let store = DataStore::from_config(&config.storage).context("failed to open data store")?;
    let position = SharedPosition::new(Position::restore(&symbol, &store.load(), calendar.timezone()));
    info!("✅ Loaded {} position layers", position.snapshot().layers.len());

    let prices = price::from_config(&config.price_api).context("failed to build price source")?;
    info!("✅ Price source initialized");

    // Telegram notifier and command handler
    let tg = TelegramNotifier::from_config(&config.telegram);
    let notifier: Arc<dyn Notifier> = match &tg {
        Some(tg) => {
            info!("📱 Telegram notifications enabled");
            Arc::new(tg.clone())
        }
        None => {
            info!("📱 Telegram disabled, notifications go to the log");
            Arc::new(telegram::LogNotifier)
        }
    };

    let mut tasks = Vec::new();

    if let Some(tg) = tg {
        let handler = CommandHandler::new(position.clone(), store.clone(), clock.clone(), config.poll.summary_minutes);
        let poller = UpdatePoller::new(tg, handler, config.telegram.poll_timeout_secs);
        tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));
        info!("✅ Telegram command handlers registered");
    }

    let reporter = SummaryReporter::new(
        symbol.clone(),
        clock.clone(),
        prices.clone(),
        notifier.clone(),
        position.clone(),
        config.poll.summary_interval(),
    );
    tasks.push(tokio::spawn(reporter.run(shutdown_rx.clone())));
    info!("✅ Scheduler started for {}-minute price updates", config.poll.summary_minutes);

    let startup = telegram::startup_message(&symbol, &config.price_api.provider, position.snapshot().layers.len());
    if let Err(e) = notifier.send(&startup).await {
        warn!("Failed to send startup notification: {:#}", e);
    }

    let poller = Poller::new(
        calendar,
        config.poll.clone(),
        clock.clone(),
        prices.clone(),
        notifier.clone(),
        position.clone(),
        Strategy::new(config.strategy.clone()),
        status.clone(),
    );
    let mut poll_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    status.set_state(RunState::Running);
    info!("✅ All tasks started");
    info!("📊 Monitoring {}...", symbol);

    tokio::select! {
        result = &mut poll_task => {
            if let Err(e) = result {
                error!("Poller task error: {}", e);
                status.set_state(RunState::Error);
                let _ = notifier.send(&telegram::error_message(&symbol, &e.to_string())).await;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gracefully...");
    status.set_state(RunState::Stopping);
    let _ = shutdown_tx.send(true);

    tasks.push(poll_task);
    if let Some(task) = health_task {
        tasks.push(task);
    }
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("Task did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }

    match store.save(&position.to_document()) {
        Ok(()) => info!("Data saved successfully"),
        Err(e) => error!("Error saving data on shutdown: {}", e),
    }

    if let Err(e) = notifier.send(&telegram::shutdown_message(&symbol)).await {
        warn!("Failed to send shutdown notification: {:#}", e);
    }

    info!("👋 Bot stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let path = Path::new(&config.file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("bot.log");
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create log dir {}", dir.display()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = if config.json {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer().with_target(false).with_thread_ids(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
