//! Scheduled capacity windows.
//!
//! A window opens at every tick of its cron recurrence (evaluated in the
//! window's timezone) and stays open for `duration`. While open, its
//! `(min, max, desired)` triple acts as a floor/ceiling override on top of
//! the metric-driven policies.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ScheduleEntry};
use crate::duration::parse_duration;

/// Longest window a schedule entry may hold open.
const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 3600);

/// The capacity triple of an active scheduled window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCapacity {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
}

/// A compiled scheduled window.
#[derive(Debug, Clone)]
pub struct ScheduledWindow {
    capacity: ScheduledCapacity,
    schedule: Schedule,
    offset: FixedOffset,
    span: TimeDelta,
}

impl ScheduledWindow {
    /// Compile a `[[schedule]]` entry.
    pub fn compile(entry: &ScheduleEntry) -> Result<Self, ConfigError> {
        let expr = normalize_cron(&entry.recurrence).map_err(|reason| ConfigError::Invalid {
            field: format!("schedule.{}.recurrence", entry.name),
            reason,
        })?;
        let schedule = Schedule::from_str(&expr).map_err(|e| ConfigError::Invalid {
            field: format!("schedule.{}.recurrence", entry.name),
            reason: e.to_string(),
        })?;
        let offset = parse_timezone(&entry.timezone).ok_or_else(|| ConfigError::Invalid {
            field: format!("schedule.{}.timezone", entry.name),
            reason: format!("unsupported timezone {:?}", entry.timezone),
        })?;
        let span = parse_duration(&entry.duration)
            .filter(|d| !d.is_zero() && *d <= MAX_WINDOW)
            .and_then(|d| TimeDelta::from_std(d).ok())
            .ok_or_else(|| ConfigError::Invalid {
                field: format!("schedule.{}.duration", entry.name),
                reason: format!(
                    "invalid duration {:?} (must be between 1s and 366d)",
                    entry.duration
                ),
            })?;
        if entry.min > entry.max {
            return Err(ConfigError::Invalid {
                field: format!("schedule.{}", entry.name),
                reason: format!("min {} exceeds max {}", entry.min, entry.max),
            });
        }

        Ok(Self {
            capacity: ScheduledCapacity {
                name: entry.name.clone(),
                min: entry.min,
                max: entry.max,
                desired: entry.desired.clamp(entry.min, entry.max),
            },
            schedule,
            offset,
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.capacity.name
    }

    pub fn capacity(&self) -> &ScheduledCapacity {
        &self.capacity
    }

    /// Whether the window is open at `now` (unix seconds).
    ///
    /// Open when some recurrence tick `t` satisfies `now - duration < t <= now`.
    pub fn is_active(&self, now: u64) -> bool {
        let Some(now_utc) = DateTime::<Utc>::from_timestamp(now as i64, 0) else {
            return false;
        };
        let now_local = now_utc.with_timezone(&self.offset);
        let Some(opened_after) = now_local.checked_sub_signed(self.span) else {
            return false;
        };

        match self.schedule.after(&opened_after).next() {
            Some(tick) => tick <= now_local,
            None => false,
        }
    }
}

/// All configured windows, in config order.
#[derive(Debug, Clone, Default)]
pub struct WindowSet {
    windows: Vec<ScheduledWindow>,
}

impl WindowSet {
    pub fn compile(entries: &[ScheduleEntry]) -> Result<Self, ConfigError> {
        let windows = entries
            .iter()
            .map(ScheduledWindow::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { windows })
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Capacity triples of every window open at `now`, in config order.
    pub fn active(&self, now: u64) -> Vec<ScheduledCapacity> {
        self.windows
            .iter()
            .filter(|w| w.is_active(now))
            .map(|w| w.capacity.clone())
            .collect()
    }
}

/// Rewrite a standard 5-field cron expression into the `cron` crate's
/// `sec min hour dom month dow` form.
///
/// Standard cron numbers weekdays 0-7 from Sunday (0 and 7 are both
/// Sunday); the `cron` crate numbers them 1-7 from Sunday. Numeric weekday
/// items are translated, named days pass through. Expressions with six or
/// more fields are taken to be in the crate's own syntax already.
pub(crate) fn normalize_cron(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = fields.as_slice() else {
        return Ok(fields.join(" "));
    };
    let dow = translate_weekdays(dow)?;
    Ok(format!("0 {minute} {hour} {dom} {month} {dow}"))
}

fn translate_weekdays(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    let mut days = BTreeSet::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let numeric = !base.is_empty() && base.chars().all(|c| c.is_ascii_digit() || c == '-');

        let (first, last) = match (base, step) {
            ("*", Some(_)) => (0, 6),
            _ if !numeric => {
                items.push(item.to_string());
                continue;
            }
            _ => match base.split_once('-') {
                Some((a, b)) => (weekday(a)?, weekday(b)?),
                None => {
                    let day = weekday(base)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };
        if first > last {
            return Err(format!("weekday range {base:?} runs backwards"));
        }
        let step = match step {
            Some(s) => s
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid weekday step {s:?}"))?,
            None => 1,
        };
        days.extend((first..=last).step_by(step).map(|day| day % 7 + 1));
    }

    items.extend(days.iter().map(u8::to_string));
    Ok(items.join(","))
}

fn weekday(s: &str) -> Result<u8, String> {
    s.parse::<u8>()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("invalid weekday {s:?}"))
}

/// Parse "UTC", "Z", or a fixed offset such as "+02:00" / "-0530".
pub(crate) fn parse_timezone(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" || s.is_empty() {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z was a Monday.
    const MONDAY_MIDNIGHT_UTC: u64 = 1_704_067_200;
    const HOUR: u64 = 3600;
    const DAY: u64 = 24 * HOUR;
    const SUNDAY_MIDNIGHT_UTC: u64 = MONDAY_MIDNIGHT_UTC - DAY;

    fn entry(recurrence: &str, timezone: &str, duration: &str) -> ScheduleEntry {
        ScheduleEntry {
            name: "business-hours".to_string(),
            min: 1,
            max: 4,
            desired: 2,
            recurrence: recurrence.to_string(),
            timezone: timezone.to_string(),
            duration: duration.to_string(),
        }
    }

    #[test]
    fn normalize_five_field_cron() {
        assert_eq!(normalize_cron("0 8 * * *").unwrap(), "0 0 8 * * *");
        assert_eq!(normalize_cron("0 8 * * 1-5").unwrap(), "0 0 8 * * 2,3,4,5,6");
        assert_eq!(normalize_cron("0 8 * * 0").unwrap(), "0 0 8 * * 1");
        assert_eq!(normalize_cron("0 8 * * 7").unwrap(), "0 0 8 * * 1");
        assert_eq!(normalize_cron("0 8 * * 5-7").unwrap(), "0 0 8 * * 1,6,7");
        assert_eq!(normalize_cron("0 8 * * */2").unwrap(), "0 0 8 * * 1,3,5,7");
        assert_eq!(normalize_cron("0 8 * * 1,3").unwrap(), "0 0 8 * * 2,4");
        assert_eq!(normalize_cron("0 18 * * Mon-Fri").unwrap(), "0 0 18 * * Mon-Fri");

        // Six fields are already in the crate's numbering.
        assert_eq!(normalize_cron("0 0 8 * * 2-6").unwrap(), "0 0 8 * * 2-6");
    }

    #[test]
    fn normalize_rejects_bad_weekdays() {
        assert!(normalize_cron("0 8 * * 8").is_err());
        assert!(normalize_cron("0 8 * * 5-2").is_err());
        assert!(normalize_cron("0 8 * * 1/0").is_err());
    }

    #[test]
    fn numeric_weekday_range_is_monday_to_friday() {
        let at = |day: u64| MONDAY_MIDNIGHT_UTC + day * DAY + 8 * HOUR + 1800;
        for recurrence in ["0 8 * * 1-5", "0 8 * * Mon-Fri"] {
            let w = ScheduledWindow::compile(&entry(recurrence, "UTC", "1h")).unwrap();
            assert!(w.is_active(at(0)), "{recurrence} on Monday");
            assert!(w.is_active(at(4)), "{recurrence} on Friday");
            assert!(!w.is_active(at(5)), "{recurrence} on Saturday");
            assert!(!w.is_active(at(6)), "{recurrence} on Sunday");
        }
    }

    #[test]
    fn sunday_accepts_zero_seven_and_name() {
        for recurrence in ["0 8 * * 0", "0 8 * * 7", "0 8 * * Sun"] {
            let w = ScheduledWindow::compile(&entry(recurrence, "UTC", "1h")).unwrap();
            assert!(w.is_active(SUNDAY_MIDNIGHT_UTC + 8 * HOUR + 1800), "{recurrence}");
            assert!(!w.is_active(MONDAY_MIDNIGHT_UTC + 8 * HOUR + 1800), "{recurrence}");
        }
    }

    #[test]
    fn weekday_follows_local_date_across_midnight() {
        // Friday 23:00 at -05:00 is Saturday 04:00 UTC.
        let friday = MONDAY_MIDNIGHT_UTC + 4 * DAY;
        let w = ScheduledWindow::compile(&entry("0 23 * * 5", "-05:00", "2h")).unwrap();
        assert!(w.is_active(friday + DAY + 4 * HOUR + 1800));
        assert!(!w.is_active(friday + 23 * HOUR + 1800));

        // Monday 01:00 at +02:00 is Sunday 23:00 UTC.
        let w = ScheduledWindow::compile(&entry("0 1 * * 1", "+02:00", "1h")).unwrap();
        assert!(w.is_active(SUNDAY_MIDNIGHT_UTC + 23 * HOUR + 1800));
        assert!(!w.is_active(MONDAY_MIDNIGHT_UTC + HOUR + 1800));
    }

    #[test]
    fn window_spanning_midnight_stays_open() {
        let friday = MONDAY_MIDNIGHT_UTC + 4 * DAY;
        let w = ScheduledWindow::compile(&entry("0 22 * * Fri", "UTC", "4h")).unwrap();
        assert!(w.is_active(friday + 22 * HOUR + 1800));
        assert!(w.is_active(friday + DAY + HOUR));
        assert!(!w.is_active(friday + DAY + 2 * HOUR));
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(parse_timezone("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_timezone("+02:00"), FixedOffset::east_opt(7200));
        assert_eq!(parse_timezone("-0530"), FixedOffset::east_opt(-19800));
        assert_eq!(parse_timezone("Europe/Berlin"), None);
        assert_eq!(parse_timezone("+25:00"), None);
    }

    #[test]
    fn window_open_inside_duration() {
        let w = ScheduledWindow::compile(&entry("0 8 * * *", "UTC", "10h")).unwrap();
        assert!(!w.is_active(MONDAY_MIDNIGHT_UTC + 7 * HOUR));
        assert!(w.is_active(MONDAY_MIDNIGHT_UTC + 8 * HOUR));
        assert!(w.is_active(MONDAY_MIDNIGHT_UTC + 17 * HOUR));
        assert!(!w.is_active(MONDAY_MIDNIGHT_UTC + 18 * HOUR));
    }

    #[test]
    fn window_respects_timezone_offset() {
        // 08:00 at +02:00 is 06:00 UTC.
        let w = ScheduledWindow::compile(&entry("0 8 * * *", "+02:00", "1h")).unwrap();
        assert!(w.is_active(MONDAY_MIDNIGHT_UTC + 6 * HOUR));
        assert!(!w.is_active(MONDAY_MIDNIGHT_UTC + 8 * HOUR));
    }

    #[test]
    fn desired_is_clamped_into_window_bounds() {
        let mut e = entry("0 8 * * *", "UTC", "1h");
        e.desired = 10;
        let w = ScheduledWindow::compile(&e).unwrap();
        assert_eq!(w.capacity().desired, 4);
    }

    #[test]
    fn compile_rejects_bad_entries() {
        assert!(ScheduledWindow::compile(&entry("not cron", "UTC", "1h")).is_err());
        assert!(ScheduledWindow::compile(&entry("0 8 * * *", "Mars/Olympus", "1h")).is_err());
        assert!(ScheduledWindow::compile(&entry("0 8 * * *", "UTC", "0s")).is_err());
        assert!(ScheduledWindow::compile(&entry("0 8 * * *", "UTC", "10000000000000h")).is_err());
        assert!(ScheduledWindow::compile(&entry("0 8 * * *", "UTC", "367d")).is_err());
        assert!(ScheduledWindow::compile(&entry("0 8 * * *", "UTC", "366d")).is_ok());
        assert!(ScheduledWindow::compile(&entry("0 8 * * 9", "UTC", "1h")).is_err());

        let mut inverted = entry("0 8 * * *", "UTC", "1h");
        inverted.min = 5;
        assert!(ScheduledWindow::compile(&inverted).is_err());
    }

    #[test]
    fn window_set_returns_active_in_order() {
        let mut night = entry("0 22 * * *", "UTC", "4h");
        night.name = "night".to_string();
        let day = entry("0 8 * * *", "UTC", "10h");

        let set = WindowSet::compile(&[day, night]).unwrap();
        assert_eq!(set.len(), 2);

        let active = set.active(MONDAY_MIDNIGHT_UTC + 9 * HOUR);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "business-hours");

        // 23:00: only the night window.
        let active = set.active(MONDAY_MIDNIGHT_UTC + 23 * HOUR);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "night");
    }
}
