//! Unrealized profit helpers used when rendering position summaries.

pub fn unrealized_pnl(current: f64, avg: f64, qty: u64) -> f64 {
    if qty == 0 {
        return 0.0;
    }
    (current - avg) * qty as f64
}

pub fn unrealized_pnl_pct(current: f64, avg: f64) -> f64 {
    if avg == 0.0 {
        return 0.0;
    }
    (current - avg) / avg * 100.0
}
