//! Host-side drivers around the alerting core: the market-hours gated poller
//! and the periodic price summary.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PollConfig;
use crate::format::{format_amount, format_price, format_quantity};
use crate::health::BotStatus;
use crate::market::{Clock, MarketCalendar, Timestamp};
use crate::position::{unrealized_pnl, unrealized_pnl_pct, PositionSnapshot, SharedPosition};
use crate::price::PriceSource;
use crate::strategy::Strategy;
use crate::telegram::{paused_message, Notifier};

/// What one tick did, and how long the caller should wait before the next.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    MarketClosed { sleep: Duration },
    Evaluated { price: f64, alerts_sent: usize, sleep: Duration },
    FetchFailed { consecutive: u32, sleep: Duration },
    Paused { consecutive: u32, sleep: Duration },
}

impl TickOutcome {
    pub fn sleep(&self) -> Duration {
        match self {
            TickOutcome::MarketClosed { sleep }
            | TickOutcome::Evaluated { sleep, .. }
            | TickOutcome::FetchFailed { sleep, .. }
            | TickOutcome::Paused { sleep, .. } => *sleep,
        }
    }
}

pub struct Poller {
    symbol: String,
    calendar: MarketCalendar,
    poll: PollConfig,
    clock: Arc<dyn Clock>,
    prices: Arc<dyn PriceSource>,
    notifier: Arc<dyn Notifier>,
    position: SharedPosition,
    strategy: Strategy,
    status: BotStatus,
    consecutive_errors: u32,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        calendar: MarketCalendar,
        poll: PollConfig,
        clock: Arc<dyn Clock>,
        prices: Arc<dyn PriceSource>,
        notifier: Arc<dyn Notifier>,
        position: SharedPosition,
        strategy: Strategy,
        status: BotStatus,
    ) -> Self {
        Self {
            symbol: strategy.config().symbol.clone(),
            calendar,
            poll,
            clock,
            prices,
            notifier,
            position,
            strategy,
            status,
            consecutive_errors: 0,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now();
        if !self.calendar.is_open(&now) {
            debug!("Market closed, sleeping...");
            return TickOutcome::MarketClosed {
                sleep: self.poll.closed_interval(),
            };
        }

        let fetched = self.prices.fetch(&self.symbol).await;
        let price = match fetched {
            Ok(price) => price,
            Err(e) => return self.on_fetch_error(&e.to_string()).await,
        };

        info!("{} price: {}", self.symbol, price);
        self.status.record_price(price);
        self.consecutive_errors = 0;

        let snapshot = self.position.snapshot();
        let alerts = self.strategy.check(price, &snapshot, now);

        let mut alerts_sent = 0;
        for alert in &alerts {
            match self.notifier.send(&alert.message).await {
                Ok(()) => {
                    alerts_sent += 1;
                    self.status.increment_alerts();
                }
                Err(e) => {
                    warn!("Failed to send {} alert: {:#}", alert.key, e);
                    self.status.record_error(&format!("notify: {}", e));
                }
            }
        }

        TickOutcome::Evaluated {
            price,
            alerts_sent,
            sleep: self.poll.open_interval(),
        }
    }

    async fn on_fetch_error(&mut self, error: &str) -> TickOutcome {
        self.consecutive_errors += 1;
        let consecutive = self.consecutive_errors;
        error!(
            "Stock API error ({}/{}): {}",
            consecutive, self.poll.max_consecutive_errors, error
        );
        self.status.record_error(error);

        if consecutive < self.poll.max_consecutive_errors {
            return TickOutcome::FetchFailed {
                consecutive,
                sleep: self.poll.error_backoff(),
            };
        }

        let notice = paused_message(consecutive);
        error!("{}", notice);
        if let Err(e) = self.notifier.send(&notice).await {
            warn!("Failed to send pause notification: {:#}", e);
        }
        self.consecutive_errors = 0;
        TickOutcome::Paused {
            consecutive,
            sleep: self.poll.pause(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Poller started for {}", self.symbol);
        loop {
            let outcome = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(outcome.sleep()) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Poller stopped");
    }
}

/// Periodic "current price" message, with PnL when a position is held.
pub fn render_price_update(symbol: &str, price: f64, position: &PositionSnapshot, now: &Timestamp) -> String {
    let mut msg = format!(
        "📊 <b>{} price:</b> {}\n🕐 {}",
        symbol,
        format_price(price),
        now.format("%H:%M:%S")
    );

    if !position.is_empty() {
        let avg = position.average_price;
        let qty = position.total_quantity;
        msg.push_str(&format!(
            "\n\n💼 Position:\n\
             \u{20}  Avg: {}\n\
             \u{20}  Qty: {}\n\
             \u{20}  PnL: {} ({:+.2}%)",
            format_price(avg),
            format_quantity(qty),
            format_amount(unrealized_pnl(price, avg, qty)),
            unrealized_pnl_pct(price, avg)
        ));
    }
    msg
}

pub struct SummaryReporter {
    symbol: String,
    clock: Arc<dyn Clock>,
    prices: Arc<dyn PriceSource>,
    notifier: Arc<dyn Notifier>,
    position: SharedPosition,
    interval: Duration,
}

impl SummaryReporter {
    pub fn new(
        symbol: String,
        clock: Arc<dyn Clock>,
        prices: Arc<dyn PriceSource>,
        notifier: Arc<dyn Notifier>,
        position: SharedPosition,
        interval: Duration,
    ) -> Self {
        Self {
            symbol,
            clock,
            prices,
            notifier,
            position,
            interval,
        }
    }

    pub async fn send_update(&self) -> anyhow::Result<()> {
        let price = self.prices.fetch(&self.symbol).await?;
        let msg = render_price_update(&self.symbol, price, &self.position.snapshot(), &self.clock.now());
        self.notifier.send(&msg).await?;
        info!("Sent price update: {}", price);
        Ok(())
    }

    /// Sends one update immediately, then every `interval`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.send_update().await {
                        error!("Failed to send price update: {:#}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
