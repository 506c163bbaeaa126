use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::BTreeSet;

use crate::config::MarketConfig;
use crate::error::ConfigError;

/// Instants handed around the bot, always carrying the market timezone.
pub type Timestamp = DateTime<Tz>;

/// Source of wall-clock time in the configured timezone.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    fn timezone(&self) -> Tz;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().with_timezone(&self.timezone)
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }
}

/// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the given local wall-clock time in `timezone`.
    pub fn at_local(
        timezone: Tz,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
    ) -> Option<Self> {
        timezone
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .map(Self::new)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }

    fn timezone(&self) -> Tz {
        self.now.lock().timezone()
    }
}

/// Trading calendar: weekdays plus an inclusive open/close window in local time.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketCalendar {
    timezone: Tz,
    /// 0 = Monday .. 6 = Sunday
    days: BTreeSet<u32>,
    open: NaiveTime,
    close: NaiveTime,
}

impl MarketCalendar {
    pub fn new(timezone: Tz, days: BTreeSet<u32>, open: NaiveTime, close: NaiveTime) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        if days.is_empty() {
            problems.push("market.days must not be empty".to_string());
        }
        if let Some(bad) = days.iter().find(|d| **d > 6) {
            problems.push(format!("market.days contains {} (expected 0..=6, 0 = Monday)", bad));
        }
        if open > close {
            problems.push(format!("market.open {} is after market.close {}", open.format("%H:%M"), close.format("%H:%M")));
        }
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        Ok(Self {
            timezone,
            days,
            open,
            close,
        })
    }

    pub fn from_config(config: &MarketConfig) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        let timezone = match config.timezone.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                problems.push(format!("market.timezone '{}' is not a known IANA timezone", config.timezone));
                None
            }
        };
        let open = parse_hhmm("market.open", &config.open, &mut problems);
        let close = parse_hhmm("market.close", &config.close, &mut problems);

        match (timezone, open, close) {
            (Some(tz), Some(open), Some(close)) if problems.is_empty() => {
                Self::new(tz, config.days.iter().map(|d| u32::from(*d)).collect(), open, close)
            }
            _ => Err(ConfigError::Invalid(problems)),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn is_open<T: TimeZone>(&self, now: &DateTime<T>) -> bool {
        let local = now.with_timezone(&self.timezone);

        if !self.days.contains(&local.weekday().num_days_from_monday()) {
            return false;
        }

        let tod = local.time();
        self.open <= tod && tod <= self.close
    }
}

fn parse_hhmm(key: &str, value: &str, problems: &mut Vec<String>) -> Option<NaiveTime> {
    match NaiveTime::parse_from_str(value.trim(), "%H:%M") {
        Ok(t) => Some(t),
        Err(_) => {
            problems.push(format!("{} '{}' is not a valid HH:MM time", key, value));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hcm_calendar() -> MarketCalendar {
        MarketCalendar::from_config(&MarketConfig::default()).unwrap()
    }

    fn local(day: u32, hour: u32, minute: u32) -> Timestamp {
        // 2026-01-19 is a Monday
        chrono_tz::Asia::Ho_Chi_Minh
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_open_boundaries_are_inclusive() {
        let cal = hcm_calendar();
        assert!(cal.is_open(&local(19, 9, 15)));
        assert!(cal.is_open(&local(19, 14, 45)));
        assert!(!cal.is_open(&local(19, 9, 14)));
        assert!(!cal.is_open(&local(19, 14, 46)));
    }

    #[test]
    fn test_weekend_is_closed_at_any_time() {
        let cal = hcm_calendar();
        for day in [24, 25] {
            for hour in 0..24 {
                assert!(!cal.is_open(&local(day, hour, 30)), "day {} hour {}", day, hour);
            }
        }
    }

    #[test]
    fn test_weekday_evaluated_in_market_timezone() {
        let cal = hcm_calendar();
        // Friday 23:00 UTC is already Saturday 06:00 in Ho Chi Minh City.
        let friday_utc = Utc.with_ymd_and_hms(2026, 1, 23, 23, 0, 0).unwrap();
        assert!(!cal.is_open(&friday_utc));
        // Monday 03:00 UTC is 10:00 local.
        let monday_utc = Utc.with_ymd_and_hms(2026, 1, 19, 3, 0, 0).unwrap();
        assert!(cal.is_open(&monday_utc));
    }

    #[test]
    fn test_rejects_bad_market_config() {
        let config = MarketConfig {
            timezone: "Mars/Olympus".to_string(),
            days: vec![],
            open: "9h15".to_string(),
            close: "14:45".to_string(),
        };
        let err = MarketCalendar::from_config(&config).unwrap_err();
        assert_eq!(err.problems().len(), 2);

        let inverted = MarketConfig {
            open: "15:00".to_string(),
            close: "09:00".to_string(),
            ..MarketConfig::default()
        };
        assert!(MarketCalendar::from_config(&inverted).is_err());

        let bad_day = MarketConfig {
            days: vec![0, 7],
            ..MarketConfig::default()
        };
        assert!(MarketCalendar::from_config(&bad_day).is_err());
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_local(chrono_tz::Asia::Ho_Chi_Minh, 2026, 1, 19, 10, 0).unwrap();
        let start = clock.now();
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now() - start, Duration::minutes(5));
        assert_eq!(clock.timezone(), chrono_tz::Asia::Ho_Chi_Minh);
    }
}
