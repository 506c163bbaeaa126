pub mod config;
pub mod error;
pub mod format;
pub mod health;
pub mod market;
pub mod monitor;
pub mod position;
pub mod price;
pub mod storage;
pub mod strategy;
pub mod telegram;

pub use config::Config;
pub use error::{ConfigError, PositionError, PriceError, StorageError};
pub use market::{Clock, ManualClock, MarketCalendar, SystemClock, Timestamp};
pub use position::{Layer, Position, PositionSnapshot, SharedPosition};
pub use strategy::{Alert, AlertKey, CooldownRegistry, Strategy};
pub use telegram::{Notifier, TelegramNotifier};
