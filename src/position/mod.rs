pub mod pnl;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::PositionError;
use crate::market::Clock;
use crate::storage::{LayerRecord, PositionDocument};

pub use pnl::{unrealized_pnl, unrealized_pnl_pct};

/// A single buy recorded against the position. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub price: f64,
    pub quantity: u64,
    pub time: DateTime<FixedOffset>,
}

impl Layer {
    pub fn cost(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

/// Append-only aggregate of layers for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    symbol: String,
    layers: Vec<Layer>,
}

/// Consistent read of a position: layers plus the derived totals.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub layers: Vec<Layer>,
    pub total_quantity: u64,
    pub average_price: f64,
}

impl PositionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.total_quantity == 0
    }

    pub fn total_value(&self) -> f64 {
        self.average_price * self.total_quantity as f64
    }
}

impl Position {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            layers: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Appends a layer stamped with the clock's current instant.
    pub fn append(&mut self, price: f64, quantity: i64, clock: &dyn Clock) -> Result<&Layer, PositionError> {
        let quantity = validate_layer(price, quantity)?;
        self.checked_total_with(quantity)?;
        let layer = Layer {
            price,
            quantity,
            time: clock.now().fixed_offset(),
        };
        self.layers.push(layer);
        Ok(&self.layers[self.layers.len() - 1])
    }

    // Every append goes through here, so the plain sum in `total_quantity` cannot overflow.
    fn checked_total_with(&self, quantity: u64) -> Result<u64, PositionError> {
        self.total_quantity().checked_add(quantity).ok_or_else(|| {
            PositionError::InvalidArgument(format!(
                "quantity {} would overflow the position total of {}",
                quantity,
                self.total_quantity()
            ))
        })
    }

    pub fn total_quantity(&self) -> u64 {
        self.layers.iter().map(|l| l.quantity).sum()
    }

    pub fn average_price(&self) -> f64 {
        let total_quantity = self.total_quantity();
        if total_quantity == 0 {
            return 0.0;
        }
        let total_cost: f64 = self.layers.iter().map(Layer::cost).sum();
        total_cost / total_quantity as f64
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            symbol: self.symbol.clone(),
            layers: self.layers.clone(),
            total_quantity: self.total_quantity(),
            average_price: self.average_price(),
        }
    }

    /// Rebuilds a position from persisted records, keeping their original stamps.
    ///
    /// Records that break the layer invariants or carry an unreadable time are
    /// skipped with a warning. Naive timestamps are read in `timezone`.
    pub fn restore(symbol: impl Into<String>, document: &PositionDocument, timezone: Tz) -> Self {
        let mut position = Self::new(symbol);

        for (index, record) in document.layers.iter().enumerate() {
            let quantity = match validate_layer(record.price, record.quantity) {
                Ok(q) => q,
                Err(e) => {
                    warn!("Skipping stored layer #{}: {}", index + 1, e);
                    continue;
                }
            };
            if let Err(e) = position.checked_total_with(quantity) {
                warn!("Skipping stored layer #{}: {}", index + 1, e);
                continue;
            }
            let Some(time) = parse_layer_time(&record.time, timezone) else {
                warn!("Skipping stored layer #{}: unreadable time '{}'", index + 1, record.time);
                continue;
            };
            position.layers.push(Layer {
                price: record.price,
                quantity,
                time,
            });
        }

        position
    }

    pub fn to_document(&self) -> PositionDocument {
        PositionDocument {
            layers: self
                .layers
                .iter()
                .map(|l| LayerRecord {
                    price: l.price,
                    quantity: l.quantity as i64,
                    time: l.time.to_rfc3339(),
                })
                .collect(),
        }
    }
}

fn validate_layer(price: f64, quantity: i64) -> Result<u64, PositionError> {
    if !price.is_finite() || price < 0.0 {
        return Err(PositionError::InvalidArgument(format!(
            "price must be a non-negative number, got {}",
            price
        )));
    }
    if quantity <= 0 {
        return Err(PositionError::InvalidArgument(format!(
            "quantity must be at least 1, got {}",
            quantity
        )));
    }
    Ok(quantity as u64)
}

fn parse_layer_time(raw: &str, timezone: Tz) -> Option<DateTime<FixedOffset>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t);
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.fixed_offset())
}

/// Position shared between the command handler (sole writer) and the poller.
#[derive(Debug, Clone)]
pub struct SharedPosition {
    inner: Arc<RwLock<Position>>,
}

impl SharedPosition {
    pub fn new(position: Position) -> Self {
        Self {
            inner: Arc::new(RwLock::new(position)),
        }
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        self.inner.read().snapshot()
    }

    pub fn append(&self, price: f64, quantity: i64, clock: &dyn Clock) -> Result<Layer, PositionError> {
        let mut position = self.inner.write();
        position.append(price, quantity, clock).cloned()
    }

    pub fn to_document(&self) -> PositionDocument {
        self.inner.read().to_document()
    }

    pub fn symbol(&self) -> String {
        self.inner.read().symbol().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::ManualClock;
    use chrono::Duration;

    fn clock() -> ManualClock {
        ManualClock::at_local(chrono_tz::Asia::Ho_Chi_Minh, 2026, 1, 19, 10, 0).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_empty_position_is_neutral() {
        let pos = Position::new("shb");
        assert_eq!(pos.symbol(), "SHB");
        assert_eq!(pos.total_quantity(), 0);
        assert_eq!(pos.average_price(), 0.0);
        let snap = pos.snapshot();
        assert!(snap.is_empty());
        assert!(snap.layers.is_empty());
    }

    #[test]
    fn test_weighted_average() {
        let clock = clock();
        let mut pos = Position::new("SHB");
        pos.append(16.5, 500, &clock).unwrap();
        pos.append(16.0, 500, &clock).unwrap();
        pos.append(15.5, 500, &clock).unwrap();
        assert_eq!(pos.total_quantity(), 1500);
        assert!(approx(pos.average_price(), 16.0));

        let mut pos = Position::new("SHB");
        pos.append(15.0, 1000, &clock).unwrap();
        pos.append(14.8, 500, &clock).unwrap();
        assert!(approx(pos.average_price(), 22400.0 / 1500.0));
    }

    #[test]
    fn test_average_times_quantity_matches_total_cost() {
        let clock = clock();
        let prices = [0.0, 0.01, 1.0, 9.99, 15.5, 16.05, 123.456, 99999.5];
        let quantities = [1_i64, 2, 7, 100, 1000, 12345];

        for (i, price) in prices.iter().enumerate() {
            let mut pos = Position::new("SHB");
            let mut expected_cost = 0.0;
            for (j, qty) in quantities.iter().enumerate() {
                let layer_price = price + (i * j) as f64 * 0.1;
                pos.append(layer_price, *qty, &clock).unwrap();
                expected_cost += layer_price * *qty as f64;
            }
            let total = pos.total_quantity() as f64;
            assert!(approx(pos.average_price() * total, expected_cost));
        }
    }

    #[test]
    fn test_append_only_growth() {
        let clock = clock();
        let mut pos = Position::new("SHB");
        let mut last_total = 0;
        for n in 1..=20 {
            pos.append(10.0 + n as f64, n, &clock).unwrap();
            clock.advance(Duration::minutes(1));
            assert_eq!(pos.layers().len(), n as usize);
            assert!(pos.total_quantity() >= last_total);
            last_total = pos.total_quantity();
        }
    }

    #[test]
    fn test_append_rejects_invalid_layers() {
        let clock = clock();
        let mut pos = Position::new("SHB");
        assert!(matches!(pos.append(-0.01, 10, &clock), Err(PositionError::InvalidArgument(_))));
        assert!(matches!(pos.append(15.0, 0, &clock), Err(PositionError::InvalidArgument(_))));
        assert!(matches!(pos.append(15.0, -3, &clock), Err(PositionError::InvalidArgument(_))));
        assert!(matches!(pos.append(f64::NAN, 3, &clock), Err(PositionError::InvalidArgument(_))));
        assert!(pos.is_empty());

        // zero price is a valid layer
        assert!(pos.append(0.0, 1, &clock).is_ok());
    }

    #[test]
    fn test_append_rejects_total_overflow() {
        let clock = clock();
        let mut pos = Position::new("SHB");
        pos.append(1.0, i64::MAX, &clock).unwrap();
        pos.append(1.0, i64::MAX, &clock).unwrap();

        let err = pos.append(1.0, 2, &clock).unwrap_err();
        assert!(err.to_string().contains("overflow"));
        assert_eq!(pos.layers().len(), 2);

        let snap = pos.snapshot();
        assert_eq!(snap.total_quantity, u64::MAX - 1);
        assert!(pos.append(1.0, 1, &clock).is_ok());
        assert_eq!(pos.total_quantity(), u64::MAX);
    }

    #[test]
    fn test_restore_skips_layers_that_overflow_total() {
        let record = LayerRecord {
            price: 1.0,
            quantity: i64::MAX,
            time: "2026-01-20T10:15:00+07:00".to_string(),
        };
        let document = PositionDocument {
            layers: vec![record.clone(), record.clone(), record],
        };
        let pos = Position::restore("SHB", &document, chrono_tz::Asia::Ho_Chi_Minh);
        assert_eq!(pos.layers().len(), 2);
        assert_eq!(pos.snapshot().total_quantity, u64::MAX - 1);
    }

    #[test]
    fn test_layer_stamped_from_clock() {
        let clock = clock();
        let mut pos = Position::new("SHB");
        let layer = pos.append(15.0, 100, &clock).unwrap().clone();
        assert_eq!(layer.time, clock.now().fixed_offset());
        assert_eq!(layer.time.offset().local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn test_equality_by_symbol_and_layers() {
        let clock = clock();
        let mut a = Position::new("SHB");
        let mut b = Position::new("shb");
        a.append(15.0, 100, &clock).unwrap();
        b.append(15.0, 100, &clock).unwrap();
        assert_eq!(a, b);

        let mut c = Position::new("VNM");
        c.append(15.0, 100, &clock).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_document_roundtrip_keeps_stamps() {
        let clock = clock();
        let mut pos = Position::new("SHB");
        pos.append(15.0, 1000, &clock).unwrap();
        clock.advance(Duration::hours(26));
        pos.append(14.8, 500, &clock).unwrap();

        let restored = Position::restore("SHB", &pos.to_document(), chrono_tz::Asia::Ho_Chi_Minh);
        assert_eq!(restored, pos);
    }

    #[test]
    fn test_restore_reads_legacy_and_skips_bad_records() {
        let document = PositionDocument {
            layers: vec![
                LayerRecord {
                    price: 15.5,
                    quantity: 1000,
                    time: "2026-01-20T10:15:30.123456".to_string(),
                },
                LayerRecord {
                    price: 15.0,
                    quantity: 0,
                    time: "2026-01-20T10:16:00+07:00".to_string(),
                },
                LayerRecord {
                    price: 15.0,
                    quantity: 10,
                    time: "yesterday".to_string(),
                },
            ],
        };
        let pos = Position::restore("SHB", &document, chrono_tz::Asia::Ho_Chi_Minh);
        assert_eq!(pos.layers().len(), 1);
        assert_eq!(pos.layers()[0].time.to_rfc3339(), "2026-01-20T10:15:30.123456+07:00");
    }

    #[test]
    fn test_shared_position_snapshot_is_consistent() {
        let clock = clock();
        let shared = SharedPosition::new(Position::new("SHB"));
        shared.append(16.0, 1000, &clock).unwrap();
        assert!(shared.append(16.0, 0, &clock).is_err());

        let snap = shared.snapshot();
        assert_eq!(snap.layers.len(), 1);
        assert_eq!(snap.total_quantity, 1000);
        assert!(approx(snap.average_price, 16.0));
        assert!(approx(snap.total_value(), 16000.0));
    }
}
