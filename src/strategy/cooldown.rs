use chrono::Duration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use tracing::debug;

use crate::market::Timestamp;

/// Classes of alerts that share one cooldown window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlertKey {
    PreBuy,
    BuyMore,
    Sell,
}

impl AlertKey {
    pub const ALL: [AlertKey; 3] = [AlertKey::PreBuy, AlertKey::BuyMore, AlertKey::Sell];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKey::PreBuy => "pre_buy",
            AlertKey::BuyMore => "buy_more",
            AlertKey::Sell => "sell",
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last successful fire per alert key. Process-local, never persisted.
#[derive(Debug, Default)]
pub struct CooldownRegistry {
    last_fired: DashMap<AlertKey, Timestamp>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `now` and returns true if `key` has never fired or its last
    /// fire is at least `cooldown` old. A refused attempt leaves the stored
    /// instant untouched.
    pub fn try_acquire(&self, key: AlertKey, now: Timestamp, cooldown: Duration) -> bool {
        // The entry guard holds the shard lock, serializing callers on the same key.
        match self.last_fired.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                debug!("Notification allowed for key: {}", key);
                true
            }
            Entry::Occupied(mut slot) => {
                let elapsed = now - *slot.get();
                if elapsed >= cooldown {
                    slot.insert(now);
                    debug!("Notification allowed for key: {}", key);
                    true
                } else {
                    debug!(
                        "Notification blocked for key: {}, cooldown remaining: {}s",
                        key,
                        (cooldown - elapsed).num_seconds()
                    );
                    false
                }
            }
        }
    }

    pub fn last_fired(&self, key: AlertKey) -> Option<Timestamp> {
        self.last_fired.get(&key).map(|t| *t.value())
    }

    /// Copy of the whole registry, ordered by key.
    pub fn entries(&self) -> Vec<(AlertKey, Timestamp)> {
        let mut entries: Vec<_> = self
            .last_fired
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }
}
