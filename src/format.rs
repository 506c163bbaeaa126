use num_format::{Locale, ToFormattedString};

/// Rounds to whole currency units and groups thousands: `1234567.6` -> `1,234,568`.
pub fn format_amount(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    (value.round() as i64).to_formatted_string(&Locale::en)
}

/// Same as [`format_amount`] with an explicit sign for non-negative values.
pub fn format_signed_amount(value: f64) -> String {
    let rounded = value.round();
    if rounded >= 0.0 {
        format!("+{}", format_amount(rounded))
    } else {
        format_amount(rounded)
    }
}

/// Two decimals with grouped thousands: `16500` -> `16,500.00`, `16.05` -> `16.05`.
pub fn format_price(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let cents = (value.abs() * 100.0).round() as i64;
    let sign = if value < 0.0 && cents != 0 { "-" } else { "" };
    format!("{}{}.{:02}", sign, (cents / 100).to_formatted_string(&Locale::en), cents % 100)
}

pub fn format_quantity(quantity: u64) -> String {
    quantity.to_formatted_string(&Locale::en)
}
