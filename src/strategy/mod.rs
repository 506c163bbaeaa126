pub mod cooldown;

use chrono::Duration;
use std::fmt;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::format::format_signed_amount;
use crate::market::Timestamp;
use crate::position::PositionSnapshot;

pub use cooldown::{AlertKey, CooldownRegistry};

/// Rendered alert ready for the notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub key: AlertKey,
    pub message: String,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Threshold evaluator bound to its configuration and cooldown registry.
pub struct Strategy {
    config: StrategyConfig,
    registry: CooldownRegistry,
}

impl Strategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            registry: CooldownRegistry::new(),
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn registry(&self) -> &CooldownRegistry {
        &self.registry
    }

    pub fn check(&self, price: f64, position: &PositionSnapshot, now: Timestamp) -> Vec<Alert> {
        evaluate(price, position, &self.config, &self.registry, now)
    }
}

/// Turns one price observation into zero or more alerts.
///
/// With an empty position only the `pre_buy` alert is considered. Otherwise
/// the buy-more check runs before the sell check and both may fire in the
/// same call. The only side effect is recording successful fires in
/// `registry`. Inputs that make the arithmetic meaningless (non-finite price,
/// non-positive average on a non-empty position) yield no alerts.
pub fn evaluate(
    price: f64,
    position: &PositionSnapshot,
    config: &StrategyConfig,
    registry: &CooldownRegistry,
    now: Timestamp,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if !price.is_finite() {
        return alerts;
    }

    let avg = position.average_price;
    let qty = position.total_quantity;
    let cooldown = Duration::minutes(i64::from(config.cooldown_minutes));

    debug!("Strategy check - Price: {}, Avg: {}, Qty: {}", price, avg, qty);

    if qty == 0 {
        // The reference price is the observation itself, so this always qualifies.
        let target = price;
        if (price - target).abs() <= config.pre_buy_range
            && registry.try_acquire(AlertKey::PreBuy, now, cooldown)
        {
            let message = format!(
                "🔔 <b>{} near buy zone</b>\n\
                 Current price: {}",
                config.symbol, price
            );
            info!("Alert: Pre-buy zone - {} @ {}", config.symbol, price);
            alerts.push(Alert {
                key: AlertKey::PreBuy,
                message,
            });
        }
        return alerts;
    }

    if !avg.is_finite() || avg <= 0.0 {
        return alerts;
    }

    if price <= avg - config.down_threshold && registry.try_acquire(AlertKey::BuyMore, now, cooldown) {
        let pnl_pct = (price - avg) / avg * 100.0;
        let message = format!(
            "📉 <b>{} dropped to buy-more threshold</b>\n\
             Avg: {:.2} | Current price: {}\n\
             Loss: {:.2}%",
            config.symbol, avg, price, pnl_pct
        );
        info!("Alert: Buy more signal - {} avg {:.2} price {} ({:.2}%)", config.symbol, avg, price, pnl_pct);
        alerts.push(Alert {
            key: AlertKey::BuyMore,
            message,
        });
    }

    if price >= avg + config.up_threshold && registry.try_acquire(AlertKey::Sell, now, cooldown) {
        let pnl_pct = (price - avg) / avg * 100.0;
        let profit = (price - avg) * qty as f64;
        let message = format!(
            "📈 <b>{} reached take-profit threshold</b>\n\
             Avg: {:.2} | Current price: {}\n\
             Profit: {:.2}% | {} VND",
            config.symbol,
            avg,
            price,
            pnl_pct,
            format_signed_amount(profit)
        );
        info!("Alert: Sell signal - {} avg {:.2} price {} ({:.2}%)", config.symbol, avg, price, pnl_pct);
        alerts.push(Alert {
            key: AlertKey::Sell,
            message,
        });
    }

    alerts
}
