use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::market::MarketCalendar;

const PLACEHOLDER_TOKEN: &str = "PUT_YOUR_BOT_TOKEN_HERE";
const PLACEHOLDER_CHAT_ID: &str = "PUT_YOUR_CHAT_ID_HERE";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub price_api: PriceApiConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_range")]
    pub pre_buy_range: f64,
    // Accepted and validated, not consulted by the evaluator.
    #[serde(default = "default_range")]
    pub pre_sell_range: f64,
    #[serde(default = "default_down_threshold")]
    pub down_threshold: f64,
    #[serde(default = "default_up_threshold")]
    pub up_threshold: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            pre_buy_range: default_range(),
            pre_sell_range: default_range(),
            down_threshold: default_down_threshold(),
            up_threshold: default_up_threshold(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

fn default_symbol() -> String { "SHB".to_string() }
fn default_range() -> f64 { 0.05 }
fn default_down_threshold() -> f64 { 0.3 }
fn default_up_threshold() -> f64 { 0.5 }
fn default_cooldown_minutes() -> u32 { 15 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// 0 = Monday .. 6 = Sunday
    #[serde(default = "default_days")]
    pub days: Vec<u8>,
    #[serde(default = "default_open")]
    pub open: String,
    #[serde(default = "default_close")]
    pub close: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            days: default_days(),
            open: default_open(),
            close: default_close(),
        }
    }
}

fn default_timezone() -> String { "Asia/Ho_Chi_Minh".to_string() }
fn default_days() -> Vec<u8> { vec![0, 1, 2, 3, 4] }
fn default_open() -> String { "09:15".to_string() }
fn default_close() -> String { "14:45".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_open_secs")]
    pub open_secs: i64,
    #[serde(default = "default_poll_closed_secs")]
    pub closed_secs: i64,
    #[serde(default = "default_summary_minutes")]
    pub summary_minutes: i64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            open_secs: default_poll_open_secs(),
            closed_secs: default_poll_closed_secs(),
            summary_minutes: default_summary_minutes(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_backoff_secs: default_error_backoff_secs(),
            pause_secs: default_pause_secs(),
        }
    }
}

impl PollConfig {
    pub fn open_interval(&self) -> Duration {
        Duration::from_secs(self.open_secs.max(1) as u64)
    }

    pub fn closed_interval(&self) -> Duration {
        Duration::from_secs(self.closed_secs.max(1) as u64)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_minutes.max(1) as u64 * 60)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }
}

fn default_poll_open_secs() -> i64 { 60 }
fn default_poll_closed_secs() -> i64 { 300 }
fn default_summary_minutes() -> i64 { 5 }
fn default_max_consecutive_errors() -> u32 { 5 }
fn default_error_backoff_secs() -> u64 { 60 }
fn default_pause_secs() -> u64 { 300 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriceApiConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_price_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for PriceApiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_price_base_url(),
            timeout_secs: default_api_timeout_secs(),
            max_retries: default_api_max_retries(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_provider() -> String { "vnd".to_string() }
fn default_price_base_url() -> String { "https://finfo-api.vndirect.com.vn".to_string() }
fn default_api_timeout_secs() -> u64 { 10 }
fn default_api_max_retries() -> u32 { 3 }
fn default_cache_ttl_secs() -> u64 { 7 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,
    #[serde(default = "default_telegram_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token: None,
            chat_id: None,
            api_url: default_telegram_api_url(),
            poll_timeout_secs: default_telegram_poll_timeout(),
        }
    }
}

fn default_true() -> bool { true }
fn default_telegram_api_url() -> String { "https://api.telegram.org".to_string() }
fn default_telegram_poll_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            json: false,
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_file() -> String { "logs/bot.log".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 { 8080 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_file")]
    pub data_file: String,
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            backup_keep: default_backup_keep(),
        }
    }
}

fn default_data_file() -> String { "storage/data.json".to_string() }
fn default_backup_keep() -> usize { 10 }

// Legacy flat variable names and the keys they override.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("TELEGRAM_BOT_TOKEN", "telegram.bot_token"),
    ("TELEGRAM_CHAT_ID", "telegram.chat_id"),
    ("STOCK_SYMBOL", "strategy.symbol"),
    ("MARKET_TIMEZONE", "market.timezone"),
    ("MARKET_OPEN_TIME", "market.open"),
    ("MARKET_CLOSE_TIME", "market.close"),
    ("POLL_INTERVAL_OPEN", "poll.open_secs"),
    ("POLL_INTERVAL_CLOSED", "poll.closed_secs"),
    ("STRATEGY_PRE_BUY_RANGE", "strategy.pre_buy_range"),
    ("STRATEGY_PRE_SELL_RANGE", "strategy.pre_sell_range"),
    ("STRATEGY_DOWN_THRESHOLD", "strategy.down_threshold"),
    ("STRATEGY_UP_THRESHOLD", "strategy.up_threshold"),
    ("STRATEGY_COOLDOWN_MINUTES", "strategy.cooldown_minutes"),
    ("STOCK_API_PROVIDER", "price_api.provider"),
    ("STOCK_API_TIMEOUT", "price_api.timeout_secs"),
    ("STOCK_API_MAX_RETRIES", "price_api.max_retries"),
    ("LOG_LEVEL", "logging.level"),
    ("LOG_FILE", "logging.file"),
    ("HEALTH_CHECK_ENABLED", "health.enabled"),
    ("HEALTH_CHECK_PORT", "health.port"),
];

// Comma separated list, e.g. `MARKET_DAYS=0,1,2,3,4`.
const ENV_MARKET_DAYS: &str = "MARKET_DAYS";

type Builder = ::config::ConfigBuilder<::config::builder::DefaultState>;

impl Config {
    pub fn load() -> Result<Arc<Self>, ConfigError> {
        dotenv::dotenv().ok();

        let builder = ::config::Config::builder()
            .add_source(::config::File::with_name("config/default").required(false))
            .add_source(
                ::config::Environment::with_prefix("BOT")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("market.days")
                    .try_parsing(true),
            );

        let builder = apply_env_overrides(builder, |var| std::env::var(var).ok())?;

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    /// Checks every section and reports all problems at once. Normalizes the
    /// symbol to upper case.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        self.strategy.symbol = self.strategy.symbol.trim().to_uppercase();
        if self.strategy.symbol.is_empty() {
            problems.push("strategy.symbol must not be empty".to_string());
        }
        for (key, value) in [
            ("strategy.pre_buy_range", self.strategy.pre_buy_range),
            ("strategy.pre_sell_range", self.strategy.pre_sell_range),
            ("strategy.down_threshold", self.strategy.down_threshold),
            ("strategy.up_threshold", self.strategy.up_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                problems.push(format!("{} must be >= 0 (got {})", key, value));
            }
        }

        if let Err(e) = MarketCalendar::from_config(&self.market) {
            problems.extend(e.problems().iter().cloned());
        }

        if self.poll.open_secs < 1 {
            problems.push("poll.open_secs must be >= 1".to_string());
        }
        if self.poll.closed_secs < 1 {
            problems.push("poll.closed_secs must be >= 1".to_string());
        }
        if self.poll.summary_minutes < 1 {
            problems.push("poll.summary_minutes must be >= 1".to_string());
        }
        if self.poll.max_consecutive_errors == 0 {
            problems.push("poll.max_consecutive_errors must be >= 1".to_string());
        }

        if self.price_api.timeout_secs == 0 {
            problems.push("price_api.timeout_secs must be >= 1".to_string());
        }

        if self.telegram.enabled {
            if is_unset(&self.telegram.bot_token, PLACEHOLDER_TOKEN) {
                problems.push("TELEGRAM_BOT_TOKEN is not set".to_string());
            }
            if is_unset(&self.telegram.chat_id, PLACEHOLDER_CHAT_ID) {
                problems.push("TELEGRAM_CHAT_ID is not set".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn calendar(&self) -> Result<MarketCalendar, ConfigError> {
        MarketCalendar::from_config(&self.market)
    }
}

/// Applies the legacy flat variables found by `lookup` on top of `builder`.
fn apply_env_overrides<F>(mut builder: Builder, lookup: F) -> Result<Builder, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (var, key) in ENV_OVERRIDES {
        if let Some(value) = lookup(var) {
            builder = builder.set_override(*key, value)?;
        }
    }

    if let Some(raw) = lookup(ENV_MARKET_DAYS) {
        builder = builder.set_override("market.days", parse_day_list(&raw)?)?;
    }

    Ok(builder)
}

fn parse_day_list(raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<i64>().map_err(|_| {
                ConfigError::Invalid(vec![format!("{} '{}' is not a comma separated list of days", ENV_MARKET_DAYS, raw)])
            })
        })
        .collect()
}

fn is_unset(value: &Option<String>, placeholder: &str) -> bool {
    match value.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(v) => v == placeholder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.telegram.bot_token = Some("123:abc".to_string());
        config.telegram.chat_id = Some("42".to_string());
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let mut config = valid();
        config.validate().unwrap();
        assert_eq!(config.strategy.symbol, "SHB");
        assert_eq!(config.strategy.cooldown_minutes, 15);
        assert_eq!(config.poll.open_interval(), Duration::from_secs(60));
        assert_eq!(config.poll.summary_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_symbol_is_normalized() {
        let mut config = valid();
        config.strategy.symbol = " vnm ".to_string();
        config.validate().unwrap();
        assert_eq!(config.strategy.symbol, "VNM");
    }

    #[test]
    fn test_rejects_negative_thresholds_and_intervals() {
        let mut config = valid();
        config.strategy.down_threshold = -0.1;
        config.strategy.up_threshold = -1.0;
        config.poll.open_secs = 0;
        config.poll.closed_secs = -5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.problems().len(), 4);
    }

    #[test]
    fn test_rejects_bad_market_section() {
        let mut config = valid();
        config.market.days = vec![];
        config.market.close = "25:00".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.problems().iter().any(|p| p.contains("market.close")));
    }

    #[test]
    fn test_telegram_credentials_required_when_enabled() {
        let mut config = Config::default();
        config.telegram.bot_token = Some(PLACEHOLDER_TOKEN.to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(err.problems().len(), 2);

        config.telegram.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [strategy]
            symbol = "hpg"
            down_threshold = 0.4

            [market]
            days = [0, 2, 4]
        "#;
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(raw, ::config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.strategy.symbol, "hpg");
        assert_eq!(config.strategy.down_threshold, 0.4);
        assert_eq!(config.strategy.up_threshold, 0.5);
        assert_eq!(config.market.days, vec![0, 2, 4]);
        assert_eq!(config.market.open, "09:15");
        assert_eq!(config.poll.closed_secs, 300);
    }

    fn load_with_env(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: std::collections::HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let builder = apply_env_overrides(::config::Config::builder(), |var| env.get(var).cloned())?;
        Ok(builder.build()?.try_deserialize()?)
    }

    #[test]
    fn test_legacy_env_overrides_are_applied() {
        let config = load_with_env(&[
            ("STRATEGY_DOWN_THRESHOLD", "0.4"),
            ("STRATEGY_UP_THRESHOLD", "0.75"),
            ("STRATEGY_COOLDOWN_MINUTES", "30"),
            ("POLL_INTERVAL_OPEN", "15"),
            ("STOCK_API_TIMEOUT", "20"),
            ("LOG_FILE", "/var/log/bot.log"),
            ("HEALTH_CHECK_ENABLED", "false"),
            ("HEALTH_CHECK_PORT", "9090"),
            ("MARKET_DAYS", "0, 2,4"),
        ])
        .unwrap();

        assert_eq!(config.strategy.down_threshold, 0.4);
        assert_eq!(config.strategy.up_threshold, 0.75);
        assert_eq!(config.strategy.cooldown_minutes, 30);
        assert_eq!(config.poll.open_secs, 15);
        assert_eq!(config.price_api.timeout_secs, 20);
        assert_eq!(config.logging.file, "/var/log/bot.log");
        assert!(!config.health.enabled);
        assert_eq!(config.health.port, 9090);
        assert_eq!(config.market.days, vec![0, 2, 4]);
        // untouched keys keep their defaults
        assert_eq!(config.strategy.pre_buy_range, 0.05);
    }

    #[test]
    fn test_malformed_market_days_is_reported() {
        let err = load_with_env(&[("MARKET_DAYS", "mon,tue")]).unwrap_err();
        assert!(err.problems()[0].contains("MARKET_DAYS"));
    }
}
