//! Duration strings used throughout `voxscale.toml`.

use std::time::Duration;

/// Parse a duration string like "500ms", "5s", "2m", "1h", "1d", or a
/// combination such as "2h30m". A bare number is read as seconds.
///
/// Returns `None` for empty or malformed input.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        let unit = match ch {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total_secs = total_secs.checked_add(n.checked_mul(unit)?)?;
        found_unit = true;
    }

    if !num_buf.is_empty() {
        // "30m15" is ambiguous.
        if found_unit {
            return None;
        }
        total_secs = num_buf.parse().ok()?;
    }

    Some(Duration::from_secs(total_secs))
}

/// Parse a duration, falling back to `default` when the string is malformed.
pub fn duration_or(s: &str, default: Duration) -> Duration {
    parse_duration(s).unwrap_or(default)
}
