//! UTC ⇄ display-timezone conversion.
//!
//! Everything persisted by herald is UTC, written in the canonical
//! `YYYY-MM-DDTHH:MM:SSZ` form so that lexical and chronological ordering
//! agree. Display values are rendered in [`DISPLAY_TZ`] (UTC+9) and, when a
//! caller supplies a recognized IANA name, in the client's own zone.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HeraldError, Result};

/// Timezone used for operator-facing rendering.
pub const DISPLAY_TZ: Tz = chrono_tz::Asia::Seoul;

/// Canonical persisted form. Fixed width, always `Z`.
pub const PERSISTED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const READABLE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// Offset-less layouts accepted from storage, tried in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Any value that can be interpreted as an instant.
#[derive(Debug, Clone)]
pub enum TimeValue {
    Aware(DateTime<FixedOffset>),
    Text(String),
}

impl From<DateTime<Utc>> for TimeValue {
    fn from(dt: DateTime<Utc>) -> Self {
        TimeValue::Aware(dt.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for TimeValue {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        TimeValue::Aware(dt)
    }
}

impl From<DateTime<Tz>> for TimeValue {
    fn from(dt: DateTime<Tz>) -> Self {
        TimeValue::Aware(dt.fixed_offset())
    }
}

impl From<&str> for TimeValue {
    fn from(s: &str) -> Self {
        TimeValue::Text(s.to_string())
    }
}

impl From<String> for TimeValue {
    fn from(s: String) -> Self {
        TimeValue::Text(s)
    }
}

/// Bundle returned by [`format_for_display`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayTime {
    /// Canonical UTC ISO-8601 string (`...Z`).
    pub utc: String,
    /// ISO-8601 string in [`DISPLAY_TZ`] with its offset.
    pub display: String,
    /// Human-readable rendering in [`DISPLAY_TZ`], e.g. `2025-08-13 15:50:13 KST`.
    pub display_readable: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientTime>,
}

/// Rendering in a caller-supplied timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTime {
    pub timezone: String,
    pub iso: String,
    pub readable: String,
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_display_tz() -> DateTime<Tz> {
    Utc::now().with_timezone(&DISPLAY_TZ)
}

/// Convert an aware instant or an ISO-8601 string to UTC.
///
/// Strings without an offset are taken to be UTC already; a trailing `Z` is
/// parsed as UTC explicitly.
pub fn to_utc(value: impl Into<TimeValue>) -> Result<DateTime<Utc>> {
    match value.into() {
        TimeValue::Aware(dt) => Ok(dt.with_timezone(&Utc)),
        TimeValue::Text(text) => {
            parse_text(&text).ok_or(HeraldError::InvalidTimestamp { value: text })
        }
    }
}

pub fn to_display_tz(value: impl Into<TimeValue>) -> Result<DateTime<Tz>> {
    Ok(to_utc(value)?.with_timezone(&DISPLAY_TZ))
}

/// Render `dt` in the canonical persisted form.
pub fn to_persisted(dt: DateTime<Utc>) -> String {
    dt.format(PERSISTED_FORMAT).to_string()
}

/// Produce every representation the web front end shows for an instant.
///
/// An unrecognized `client_timezone` is dropped silently.
pub fn format_for_display(
    value: impl Into<TimeValue>,
    client_timezone: Option<&str>,
) -> Result<DisplayTime> {
    let utc = to_utc(value)?;
    let local = utc.with_timezone(&DISPLAY_TZ);

    let client = client_timezone
        .and_then(|name| name.parse::<Tz>().ok().map(|tz| (name, tz)))
        .map(|(name, tz)| {
            let there = utc.with_timezone(&tz);
            ClientTime {
                timezone: name.to_string(),
                iso: there.to_rfc3339_opts(SecondsFormat::Secs, true),
                readable: there.format(READABLE_FORMAT).to_string(),
            }
        });

    Ok(DisplayTime {
        utc: to_persisted(utc),
        display: local.to_rfc3339_opts(SecondsFormat::Secs, true),
        display_readable: local.format(READABLE_FORMAT).to_string(),
        timestamp: utc.timestamp(),
        client,
    })
}

/// Read a timestamp column written by any past version of the application.
///
/// Accepts ISO-8601 with `Z`, ISO-8601 with an explicit offset, and the
/// space-separated forms with or without fractional seconds. Text that
/// matches none of them yields the current instant; the bad value is logged.
pub fn parse_persisted_timestamp(text: &str) -> DateTime<Utc> {
    match parse_text(text) {
        Some(dt) => dt,
        None => {
            warn!(value = %text, "unparseable persisted timestamp, falling back to now");
            now_utc()
        }
    }
}

fn parse_text(text: &str) -> Option<DateTime<Utc>> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // `Z` on a layout RFC 3339 rejects (space separator): UTC either way.
    let naive_part = s.strip_suffix('Z').unwrap_or(s);
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive_part, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};

    fn expected(micros: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 13, 6, 50, 13).unwrap()
            + Duration::microseconds(micros as i64)
    }

    #[test]
    fn persisted_formats_agree() {
        assert_eq!(parse_persisted_timestamp("2025-08-13T06:50:13Z"), expected(0));
        assert_eq!(
            parse_persisted_timestamp("2025-08-13T06:50:13.227366Z"),
            expected(227_366)
        );
        assert_eq!(parse_persisted_timestamp("2025-08-13 06:50:13"), expected(0));
        assert_eq!(
            parse_persisted_timestamp("2025-08-13 06:50:13.227366"),
            expected(227_366)
        );
    }

    #[test]
    fn explicit_offset_is_normalised() {
        assert_eq!(
            parse_persisted_timestamp("2025-08-13T15:50:13+09:00"),
            expected(0)
        );
        assert_eq!(
            parse_persisted_timestamp("2025-08-13 15:50:13+09:00"),
            expected(0)
        );
    }

    #[test]
    fn garbage_falls_back_to_now() {
        let before = Utc::now();
        let parsed = parse_persisted_timestamp("not a timestamp");
        let after = Utc::now();
        assert!(parsed >= before && parsed <= after);
    }

    #[test]
    fn to_utc_treats_naive_text_as_utc() {
        let dt = to_utc("2025-08-13T06:50:13").unwrap();
        assert_eq!(dt, expected(0));
        assert!(to_utc("yesterday-ish").is_err());
    }

    #[test]
    fn to_display_tz_is_nine_hours_ahead() {
        let local = to_display_tz(expected(0)).unwrap();
        assert_eq!(local.hour(), 15);
        assert_eq!(local.minute(), 50);
    }

    #[test]
    fn persisted_form_is_fixed_width() {
        let s = to_persisted(expected(227_366));
        assert_eq!(s, "2025-08-13T06:50:13Z");
        assert_eq!(s.len(), 20);
    }

    #[test]
    fn display_bundle_includes_known_client_zone() {
        let shown = format_for_display(expected(0), Some("America/New_York")).unwrap();
        assert_eq!(shown.utc, "2025-08-13T06:50:13Z");
        assert_eq!(shown.display, "2025-08-13T15:50:13+09:00");
        assert_eq!(shown.display_readable, "2025-08-13 15:50:13 KST");
        assert_eq!(shown.timestamp, expected(0).timestamp());
        let client = shown.client.expect("client rendering");
        assert_eq!(client.timezone, "America/New_York");
        assert_eq!(client.iso, "2025-08-13T02:50:13-04:00");
    }

    #[test]
    fn unknown_client_zone_is_omitted() {
        let shown = format_for_display("2025-08-13T06:50:13Z", Some("Mars/Olympus")).unwrap();
        assert!(shown.client.is_none());
        let json = serde_json::to_string(&shown).unwrap();
        assert!(!json.contains("client"));
    }
}
