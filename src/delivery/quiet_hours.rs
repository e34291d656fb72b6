//! Quiet-hours window evaluated in a local timezone.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Resolve a timezone name. Accepts the Indonesian abbreviations
/// `WIB`, `WITA` and `WIT`, or any IANA name.
pub fn resolve_timezone(name: &str) -> Option<Tz> {
    match name.trim().to_ascii_uppercase().as_str() {
        "WIB" => Some(chrono_tz::Asia::Jakarta),
        "WITA" => Some(chrono_tz::Asia::Makassar),
        "WIT" => Some(chrono_tz::Asia::Jayapura),
        _ => name.trim().parse::<Tz>().ok(),
    }
}

/// Local-time window `[start_hour, end_hour)` during which sends are deferred.
///
/// `start_hour == end_hour` means quiet hours are not configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub timezone: Tz,
}

impl QuietHours {
    pub fn new(start_hour: u32, end_hour: u32, timezone: Tz) -> Self {
        Self {
            start_hour,
            end_hour,
            timezone,
        }
    }

    /// A window that never suppresses sends.
    pub fn disabled() -> Self {
        Self::new(0, 0, chrono_tz::Asia::Jakarta)
    }

    pub fn is_enabled(&self) -> bool {
        self.start_hour != self.end_hour
    }

    /// Whether `now` falls inside the window.
    pub fn is_quiet(&self, now: DateTime<Utc>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let hour = now.with_timezone(&self.timezone).hour();
        if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            hour >= self.start_hour && hour < self.end_hour
        }
    }

    /// The next `end_hour:00` local time: today, or tomorrow once today's has passed.
    pub fn next_active_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.timezone);
        let mut date = local.date_naive();
        if local.hour() >= self.end_hour {
            date += Duration::days(1);
        }

        date.and_hms_opt(self.end_hour, 0, 0)
            .and_then(|naive| self.timezone.from_local_datetime(&naive).earliest())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| now + Duration::hours(1))
    }
}

/// Parse a reminder due date. RFC 3339 values carry their own offset; naive
/// `YYYY-MM-DDTHH:MM[:SS]` values are read in `tz`.
pub fn parse_due_date(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|t| t.with_timezone(&Utc))
}
