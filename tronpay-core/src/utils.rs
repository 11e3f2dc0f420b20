//! Small shared helpers: clocks, amount rounding, and log masking.

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Transfer timestamps on the explorer wire are millisecond-based, so the
/// whole matching pipeline works in this unit.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Current wall-clock time in seconds since the Unix epoch.
///
/// Form expiry deadlines are second-based.
pub fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Round a value to 4 decimal places, the canonical amount precision.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Mask a wallet address for log output: first 4 + last 4 characters.
pub fn mask_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Mask an amount for log output.
pub fn mask_amount(_amount: f64) -> &'static str {
    "***.**"
}
