use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Uniform draw from an inclusive millisecond range; a degenerate range yields its bound.
pub fn jitter_ms<R: Rng + ?Sized>(rng: &mut R, min_ms: u64, max_ms: u64) -> u64 {
    if max_ms <= min_ms {
        min_ms
    } else {
        rng.gen_range(min_ms..=max_ms)
    }
}

/// Cut a string to at most `max` chars without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

/// Render an amount in minor units (cents, fen) as a two-decimal figure.
pub fn format_minor_units(amount: u64) -> String {
    format!("{}.{:02}", amount / 100, amount % 100)
}
