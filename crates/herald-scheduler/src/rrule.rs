//! RFC 5545 recurrence rules, evaluated in UTC.
//!
//! Supported: `DTSTART` (UTC or floating, read as UTC), `FREQ` from SECONDLY
//! to YEARLY, `INTERVAL`, `COUNT`, `UNTIL`, `BYMONTH`, `BYMONTHDAY`, `BYDAY`
//! (ordinals only with `FREQ=MONTHLY`), `BYHOUR`, `BYMINUTE`, `BYSECOND` and
//! `WKST`. Anything else is rejected at parse time rather than silently
//! ignored, so a stored rule either means what it says or never runs.

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
    Utc, Weekday,
};

use crate::error::{Result, SchedulerError};

/// Upper bound on recurrence periods scanned by a single lookup.
const MAX_PERIODS: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FromStr for Frequency {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "SECONDLY" => Frequency::Secondly,
            "MINUTELY" => Frequency::Minutely,
            "HOURLY" => Frequency::Hourly,
            "DAILY" => Frequency::Daily,
            "WEEKLY" => Frequency::Weekly,
            "MONTHLY" => Frequency::Monthly,
            "YEARLY" => Frequency::Yearly,
            other => return Err(invalid(format!("unknown FREQ `{other}`"))),
        })
    }
}

/// One `BYDAY` entry: a weekday, optionally the n-th of the month
/// (negative counts from the end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekdaySpec {
    pub nth: Option<i32>,
    pub weekday: Weekday,
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    /// Explicit `DTSTART`, if the text carried one.
    pub dtstart: Option<DateTime<Utc>>,
    pub freq: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub by_month: Vec<u32>,
    pub by_month_day: Vec<i32>,
    pub by_day: Vec<WeekdaySpec>,
    pub by_hour: Vec<u32>,
    pub by_minute: Vec<u32>,
    pub by_second: Vec<u32>,
    pub week_start: Weekday,
}

impl FromStr for RecurrenceRule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        RecurrenceRule::parse(s)
    }
}

impl RecurrenceRule {
    /// Parse `RRULE:`-prefixed or bare rule text, optionally preceded by a
    /// `DTSTART` line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut dtstart = None;
        let mut body = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let upper = line.to_ascii_uppercase();
            if upper.starts_with("DTSTART") {
                dtstart = Some(parse_dtstart(line)?);
            } else if let Some(rest) = upper.strip_prefix("RRULE:") {
                body = Some(rest.to_string());
            } else if upper.contains("FREQ=") {
                body = Some(upper);
            } else {
                return Err(invalid(format!("unrecognized line `{line}`")));
            }
        }

        let body = body.ok_or_else(|| invalid("missing RRULE".to_string()))?;
        let mut rule = RecurrenceRule {
            dtstart,
            freq: Frequency::Daily,
            interval: 1,
            count: None,
            until: None,
            by_month: Vec::new(),
            by_month_day: Vec::new(),
            by_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_second: Vec::new(),
            week_start: Weekday::Mon,
        };
        let mut saw_freq = false;

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed part `{part}`")))?;
            match key {
                "FREQ" => {
                    rule.freq = value.parse()?;
                    saw_freq = true;
                }
                "INTERVAL" => {
                    rule.interval = parse_num(key, value, 1, u32::MAX as i64)? as u32;
                }
                "COUNT" => rule.count = Some(parse_num(key, value, 1, u32::MAX as i64)? as u32),
                "UNTIL" => rule.until = Some(parse_until(value)?),
                "BYMONTH" => rule.by_month = parse_list(key, value, 1, 12)?,
                "BYMONTHDAY" => {
                    let days: Vec<i32> = parse_list(key, value, -31, 31)?;
                    if days.contains(&0) {
                        return Err(invalid("BYMONTHDAY cannot be 0".to_string()));
                    }
                    rule.by_month_day = days;
                }
                "BYDAY" => {
                    rule.by_day = value
                        .split(',')
                        .map(parse_weekday_spec)
                        .collect::<Result<Vec<_>>>()?;
                }
                "BYHOUR" => rule.by_hour = parse_list(key, value, 0, 23)?,
                "BYMINUTE" => rule.by_minute = parse_list(key, value, 0, 59)?,
                "BYSECOND" => rule.by_second = parse_list(key, value, 0, 59)?,
                "WKST" => rule.week_start = parse_weekday(value)?,
                other => return Err(invalid(format!("unsupported rule part `{other}`"))),
            }
        }

        if !saw_freq {
            return Err(invalid("FREQ is required".to_string()));
        }
        if rule.count.is_some() && rule.until.is_some() {
            return Err(invalid("COUNT and UNTIL are mutually exclusive".to_string()));
        }
        if rule.freq != Frequency::Monthly && rule.by_day.iter().any(|d| d.nth.is_some()) {
            return Err(invalid(
                "BYDAY ordinals are only supported with FREQ=MONTHLY".to_string(),
            ));
        }
        Ok(rule)
    }

    /// First occurrence strictly after `after`.
    ///
    /// `anchor` stands in for `DTSTART` when the rule text has none. Returns
    /// `Ok(None)` once the rule is exhausted by `COUNT` or `UNTIL`, and
    /// [`SchedulerError::ScanLimit`] when no answer was found within
    /// `MAX_PERIODS` periods.
    pub fn next_after(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let start = self.dtstart.unwrap_or(anchor).naive_utc();
        let after = after.naive_utc();
        let base = self.period_base(start);
        let target = self.periods_between(base, after);
        let per_period = self.uniform_period_size();

        // COUNT has to be tallied from the first period; otherwise jump
        // straight to the period containing `after`.
        let mut k = if self.count.is_some() { 0 } else { target };
        let mut emitted: u64 = 0;

        for _ in 0..MAX_PERIODS {
            let Some(period) = self.period_start(base, k) else {
                return Ok(None);
            };
            if let Some(until) = self.until {
                if period > until.naive_utc() {
                    return Ok(None);
                }
            }
            if let Some(resume) = self.skip_unmatched(period) {
                k = (k + 1).max(self.periods_between(base, resume));
                continue;
            }
            for t in self.expand(start, period) {
                if t < start {
                    continue;
                }
                if self.until.is_some_and(|u| t > u.naive_utc()) {
                    return Ok(None);
                }
                emitted += 1;
                if self.count.is_some_and(|c| emitted > c as u64) {
                    return Ok(None);
                }
                if t > after {
                    return Ok(Some(Utc.from_utc_datetime(&t)));
                }
            }
            k += 1;
            // Past the first period every period of a uniform rule emits the
            // same number of instants, so COUNT can be tallied in one step.
            if let Some(n) = per_period {
                if k < target {
                    emitted = emitted.saturating_add((target - k).saturating_mul(n));
                    k = target;
                }
            }
        }
        Err(SchedulerError::ScanLimit {
            periods: MAX_PERIODS,
        })
    }

    /// Instants per period when every period yields the same set, i.e. no
    /// BY-part filters at or above the frequency. `None` otherwise.
    fn uniform_period_size(&self) -> Option<u64> {
        if rank(self.freq) > rank(Frequency::Daily)
            || !self.by_month.is_empty()
            || !self.by_month_day.is_empty()
            || !self.by_day.is_empty()
        {
            return None;
        }
        let mut size = 1u64;
        for (level, by) in [
            (Frequency::Hourly, &self.by_hour),
            (Frequency::Minutely, &self.by_minute),
            (Frequency::Secondly, &self.by_second),
        ] {
            if finer_or_equal(self.freq, level) {
                if !by.is_empty() {
                    return None;
                }
            } else if !by.is_empty() {
                let mut v = by.clone();
                v.sort_unstable();
                v.dedup();
                size *= v.len() as u64;
            }
        }
        Some(size)
    }

    /// For a daily or finer period that no candidate can match, the earliest
    /// instant a later period could match again.
    fn skip_unmatched(&self, period: NaiveDateTime) -> Option<NaiveDateTime> {
        if rank(self.freq) > rank(Frequency::Daily) {
            return None;
        }
        let date = period.date();
        if !self.by_month.is_empty() && !self.by_month.contains(&date.month()) {
            let next_month = date.with_day(1)?.checked_add_months(Months::new(1))?;
            return Some(next_month.and_time(NaiveTime::MIN));
        }
        if self.freq == Frequency::Daily {
            return None;
        }
        if !self.date_matches(date, period) {
            return Some(date.succ_opt()?.and_time(NaiveTime::MIN));
        }
        let hour_start = date.and_hms_opt(period.hour(), 0, 0)?;
        if rank(self.freq) < rank(Frequency::Hourly)
            && !self.by_hour.is_empty()
            && !self.by_hour.contains(&period.hour())
        {
            return hour_start.checked_add_signed(Duration::hours(1));
        }
        if self.freq == Frequency::Secondly
            && !self.by_minute.is_empty()
            && !self.by_minute.contains(&period.minute())
        {
            let next_minute = Duration::minutes(period.minute() as i64 + 1);
            return hour_start.checked_add_signed(next_minute);
        }
        None
    }

    /// Start of the period that contains `start`.
    fn period_base(&self, start: NaiveDateTime) -> NaiveDateTime {
        let date = start.date();
        let midnight = |d: NaiveDate| d.and_time(NaiveTime::MIN);
        match self.freq {
            Frequency::Secondly => start.with_nanosecond(0).unwrap_or(start),
            Frequency::Minutely => date
                .and_hms_opt(start.hour(), start.minute(), 0)
                .unwrap_or(start),
            Frequency::Hourly => date.and_hms_opt(start.hour(), 0, 0).unwrap_or(start),
            Frequency::Daily => midnight(date),
            Frequency::Weekly => {
                let back = days_since(date.weekday(), self.week_start);
                midnight(date - Duration::days(back))
            }
            Frequency::Monthly => midnight(date.with_day(1).unwrap_or(date)),
            Frequency::Yearly => {
                midnight(NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date))
            }
        }
    }

    /// Index of the interval-aligned period containing `t`, counted from `base`.
    fn periods_between(&self, base: NaiveDateTime, t: NaiveDateTime) -> u64 {
        if t <= base {
            return 0;
        }
        let units = match self.freq {
            Frequency::Secondly => (t - base).num_seconds(),
            Frequency::Minutely => (t - base).num_minutes(),
            Frequency::Hourly => (t - base).num_hours(),
            Frequency::Daily => (t - base).num_days(),
            Frequency::Weekly => (t - base).num_weeks(),
            Frequency::Monthly => {
                (t.year() - base.year()) as i64 * 12 + t.month() as i64 - base.month() as i64
            }
            Frequency::Yearly => (t.year() - base.year()) as i64,
        };
        (units.max(0) as u64) / self.interval as u64
    }

    fn period_start(&self, base: NaiveDateTime, k: u64) -> Option<NaiveDateTime> {
        let steps = k.checked_mul(self.interval as u64)?;
        let small = |unit: i64| -> Option<NaiveDateTime> {
            let n = i64::try_from(steps).ok()?.checked_mul(unit)?;
            base.checked_add_signed(Duration::try_seconds(n)?)
        };
        match self.freq {
            Frequency::Secondly => small(1),
            Frequency::Minutely => small(60),
            Frequency::Hourly => small(3_600),
            Frequency::Daily => small(86_400),
            Frequency::Weekly => small(7 * 86_400),
            Frequency::Monthly => base.checked_add_months(Months::new(u32::try_from(steps).ok()?)),
            Frequency::Yearly => {
                let months = u32::try_from(steps.checked_mul(12)?).ok()?;
                base.checked_add_months(Months::new(months))
            }
        }
    }

    /// All candidate instants inside one period, ascending.
    fn expand(&self, start: NaiveDateTime, period: NaiveDateTime) -> Vec<NaiveDateTime> {
        let first = period.date();
        let dates: Vec<NaiveDate> = match self.freq {
            Frequency::Secondly
            | Frequency::Minutely
            | Frequency::Hourly
            | Frequency::Daily => vec![first],
            Frequency::Weekly => first.iter_days().take(7).collect(),
            Frequency::Monthly => first
                .iter_days()
                .take_while(|d| d.month() == first.month())
                .collect(),
            Frequency::Yearly => first
                .iter_days()
                .take_while(|d| d.year() == first.year())
                .collect(),
        };

        let hours = self.time_component(Frequency::Hourly, &self.by_hour, period.hour(), start.hour());
        let minutes =
            self.time_component(Frequency::Minutely, &self.by_minute, period.minute(), start.minute());
        let seconds =
            self.time_component(Frequency::Secondly, &self.by_second, period.second(), start.second());

        let mut out = Vec::new();
        for date in dates.into_iter().filter(|d| self.date_matches(*d, start)) {
            for &h in &hours {
                for &m in &minutes {
                    for &s in &seconds {
                        if let Some(t) = date.and_hms_opt(h, m, s) {
                            out.push(t);
                        }
                    }
                }
            }
        }
        out
    }

    /// Values for one time field. When the frequency is at least as fine as
    /// `level` the period fixes the field and the BY-list only filters it;
    /// otherwise the BY-list expands it, defaulting to DTSTART's value.
    fn time_component(&self, level: Frequency, by: &[u32], in_period: u32, from_start: u32) -> Vec<u32> {
        if finer_or_equal(self.freq, level) {
            if by.is_empty() || by.contains(&in_period) {
                vec![in_period]
            } else {
                Vec::new()
            }
        } else if by.is_empty() {
            vec![from_start]
        } else {
            let mut v = by.to_vec();
            v.sort_unstable();
            v.dedup();
            v
        }
    }

    fn date_matches(&self, date: NaiveDate, start: NaiveDateTime) -> bool {
        let implicit_day = self.by_month_day.is_empty() && self.by_day.is_empty();

        if !self.by_month.is_empty() {
            if !self.by_month.contains(&date.month()) {
                return false;
            }
        } else if implicit_day && self.freq == Frequency::Yearly && date.month() != start.month() {
            return false;
        }

        if !self.by_month_day.is_empty() {
            let len = days_in_month(date);
            let hit = self.by_month_day.iter().any(|&d| {
                let resolved = if d > 0 { d } else { len as i32 + 1 + d };
                resolved == date.day() as i32
            });
            if !hit {
                return false;
            }
        } else if implicit_day
            && matches!(self.freq, Frequency::Monthly | Frequency::Yearly)
            && date.day() != start.day()
        {
            return false;
        }

        if !self.by_day.is_empty() {
            return self.by_day.iter().any(|spec| weekday_matches(spec, date));
        }
        if self.freq == Frequency::Weekly && implicit_day {
            return date.weekday() == start.weekday();
        }
        true
    }
}

fn finer_or_equal(freq: Frequency, level: Frequency) -> bool {
    rank(freq) <= rank(level)
}

fn rank(freq: Frequency) -> u8 {
    match freq {
        Frequency::Secondly => 0,
        Frequency::Minutely => 1,
        Frequency::Hourly => 2,
        Frequency::Daily => 3,
        Frequency::Weekly => 4,
        Frequency::Monthly => 5,
        Frequency::Yearly => 6,
    }
}

fn weekday_matches(spec: &WeekdaySpec, date: NaiveDate) -> bool {
    if date.weekday() != spec.weekday {
        return false;
    }
    match spec.nth {
        None => true,
        Some(n) if n > 0 => (date.day() as i32 - 1) / 7 + 1 == n,
        Some(n) => {
            let from_end = (days_in_month(date) as i32 - date.day() as i32) / 7 + 1;
            from_end == -n
        }
    }
}

fn days_in_month(date: NaiveDate) -> u32 {
    let first = date.with_day(1).unwrap_or(date);
    let next = first + Months::new(1);
    (next - first).num_days() as u32
}

fn days_since(day: Weekday, week_start: Weekday) -> i64 {
    (7 + day.num_days_from_monday() as i64 - week_start.num_days_from_monday() as i64) % 7
}

fn parse_dtstart(line: &str) -> Result<DateTime<Utc>> {
    let (head, value) = line
        .split_once(':')
        .ok_or_else(|| invalid(format!("malformed DTSTART `{line}`")))?;
    if let Some((_, params)) = head.split_once(';') {
        let tzid = params.to_ascii_uppercase();
        if !matches!(tzid.as_str(), "TZID=UTC" | "TZID=ETC/UTC" | "VALUE=DATE-TIME") {
            return Err(invalid(format!("unsupported DTSTART parameter `{params}`")));
        }
    }
    parse_datetime(value.trim())
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    let naive = value.strip_suffix('Z').unwrap_or(value);
    NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S")
        .map(|dt| Utc.from_utc_datetime(&dt))
        .map_err(|_| invalid(format!("bad date-time `{value}`")))
}

fn parse_until(value: &str) -> Result<DateTime<Utc>> {
    if value.contains('T') {
        return parse_datetime(value);
    }
    // A bare date includes the whole day.
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| invalid(format!("bad UNTIL `{value}`")))
}

fn parse_num(key: &str, value: &str, min: i64, max: i64) -> Result<i64> {
    let n: i64 = value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{key}: `{value}` is not a number")))?;
    if n < min || n > max {
        return Err(invalid(format!("{key}: {n} out of range {min}..={max}")));
    }
    Ok(n)
}

fn parse_list<T: TryFrom<i64>>(key: &str, value: &str, min: i64, max: i64) -> Result<Vec<T>> {
    value
        .split(',')
        .map(|v| {
            let n = parse_num(key, v, min, max)?;
            T::try_from(n).map_err(|_| invalid(format!("{key}: {n} out of range")))
        })
        .collect()
}

fn parse_weekday_spec(token: &str) -> Result<WeekdaySpec> {
    let token = token.trim();
    if token.len() < 2 {
        return Err(invalid(format!("bad BYDAY `{token}`")));
    }
    let (nth, day) = token.split_at(token.len() - 2);
    let nth = if nth.is_empty() {
        None
    } else {
        let n: i32 = nth
            .trim_start_matches('+')
            .parse()
            .map_err(|_| invalid(format!("bad BYDAY ordinal `{token}`")))?;
        if n == 0 || !(-5..=5).contains(&n) {
            return Err(invalid(format!("BYDAY ordinal out of range `{token}`")));
        }
        Some(n)
    };
    Ok(WeekdaySpec {
        nth,
        weekday: parse_weekday(day)?,
    })
}

fn parse_weekday(s: &str) -> Result<Weekday> {
    Ok(match s {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        other => return Err(invalid(format!("unknown weekday `{other}`"))),
    })
}

fn invalid(msg: String) -> SchedulerError {
    SchedulerError::InvalidRule(msg)
}
