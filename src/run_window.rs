//! Recurring time-of-day windows that gate when a check may run.
//!
//! A [`RunWindow`] is a set of [`Window`]s. With no windows the check may
//! always run; otherwise it may run while any window is active. A window whose
//! end time is earlier than its start time spans midnight.
//!
//! Recurrence rules use the RRULE syntax (`RRULE:FREQ=WEEKLY;BYDAY=MO,TU`),
//! restricted to daily and weekly rules with an interval of one.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TIME_FMT: &str = "%H:%M";

const MISSING_DAYS: &str = "weekly rule must list at least one day in BYDAY";

/// Run window error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunWindowError {
    #[error("invalid time '{0}', expected HH:MM")]
    Time(String),
    #[error("invalid recurrence rule: {0}")]
    Rule(String),
    #[error("invalid run window json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
}

/// A day-of-week repeat pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub by_day: Vec<Weekday>,
}

impl Recurrence {
    pub fn daily() -> Self {
        Self {
            frequency: Frequency::Daily,
            by_day: Vec::new(),
        }
    }

    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut by_day: Vec<Weekday> = Vec::new();
        for day in days {
            if !by_day.contains(&day) {
                by_day.push(day);
            }
        }
        Self {
            frequency: Frequency::Weekly,
            by_day,
        }
    }

    fn occurs_on(&self, date: NaiveDate) -> bool {
        self.by_day.is_empty() || self.by_day.contains(&date.weekday())
    }

    /// Latest instance in `[anchor, now]`. Instances fall at the anchor's
    /// time of day on every matching date.
    fn last_instance(&self, anchor: NaiveDateTime, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut day = now.date();
        while day >= anchor.date() {
            let candidate = day.and_time(anchor.time());
            if candidate >= anchor && candidate <= now && self.occurs_on(day) {
                return Some(candidate);
            }
            day = day.pred_opt()?;
        }
        None
    }
}

impl FromStr for Recurrence {
    type Err = RunWindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut frequency = None;
        let mut by_day = Vec::new();

        for line in s.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("DTSTART") {
                continue;
            }
            let rule = line.strip_prefix("RRULE:").unwrap_or(line);

            for part in rule.split(';').filter(|p| !p.is_empty()) {
                let (key, value) = part
                    .split_once('=')
                    .ok_or_else(|| RunWindowError::Rule(format!("malformed part '{}'", part)))?;

                match key.to_ascii_uppercase().as_str() {
                    "FREQ" => {
                        frequency = Some(match value.to_ascii_uppercase().as_str() {
                            "DAILY" => Frequency::Daily,
                            "WEEKLY" => Frequency::Weekly,
                            other => {
                                return Err(RunWindowError::Rule(format!(
                                    "unsupported frequency '{}'",
                                    other
                                )))
                            }
                        });
                    }
                    "INTERVAL" => {
                        if value.trim() != "1" {
                            return Err(RunWindowError::Rule(format!(
                                "unsupported interval '{}'",
                                value
                            )));
                        }
                    }
                    "BYDAY" => {
                        for code in value.split(',').filter(|c| !c.is_empty()) {
                            let day = parse_weekday(code).ok_or_else(|| {
                                RunWindowError::Rule(format!("unknown day '{}'", code))
                            })?;
                            if !by_day.contains(&day) {
                                by_day.push(day);
                            }
                        }
                    }
                    "WKST" => {}
                    other => {
                        return Err(RunWindowError::Rule(format!(
                            "unsupported rule part '{}'",
                            other
                        )))
                    }
                }
            }
        }

        let frequency =
            frequency.ok_or_else(|| RunWindowError::Rule("missing FREQ".to_string()))?;
        if frequency == Frequency::Weekly && by_day.is_empty() {
            return Err(RunWindowError::Rule(MISSING_DAYS.to_string()));
        }

        Ok(Self { frequency, by_day })
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let freq = match self.frequency {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
        };
        write!(f, "RRULE:FREQ={}", freq)?;
        if !self.by_day.is_empty() {
            let days: Vec<&str> = self.by_day.iter().map(|d| weekday_code(*d)).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        Ok(())
    }
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn parse_weekday(code: &str) -> Option<Weekday> {
    match code.trim().to_ascii_uppercase().as_str() {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, RunWindowError> {
    NaiveTime::parse_from_str(s.trim(), TIME_FMT).map_err(|_| RunWindowError::Time(s.to_string()))
}

fn to_minute(t: NaiveTime) -> NaiveTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Stored shape of a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowRecord {
    start_time: String,
    end_time: String,
    rrule: String,
}

/// A single recurring window, e.g. "weekdays 09:00 to 17:00".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WindowRecord", into = "WindowRecord")]
pub struct Window {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub recurrence: Recurrence,
}

impl Window {
    pub fn new(start_time: NaiveTime, end_time: NaiveTime, recurrence: Recurrence) -> Self {
        Self {
            start_time: to_minute(start_time),
            end_time: to_minute(end_time),
            recurrence,
        }
    }

    /// Whether `now` falls inside this window.
    ///
    /// The recurrence is anchored at yesterday's start time so that an
    /// occurrence which began yesterday (an overnight window) is still found.
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        let now = now.naive_utc();
        let Some(yesterday) = now.date().pred_opt() else {
            return false;
        };
        let anchor = yesterday.and_time(self.start_time);

        let Some(start) = self.recurrence.last_instance(anchor, now) else {
            return false;
        };

        let mut end = start.date().and_time(self.end_time);
        if self.end_time < self.start_time {
            end += Duration::days(1);
        }

        start <= now && now <= end
    }
}

impl TryFrom<WindowRecord> for Window {
    type Error = RunWindowError;

    fn try_from(record: WindowRecord) -> Result<Self, Self::Error> {
        Ok(Window::new(
            parse_time(&record.start_time)?,
            parse_time(&record.end_time)?,
            record.rrule.parse()?,
        ))
    }
}

impl From<Window> for WindowRecord {
    fn from(window: Window) -> Self {
        WindowRecord {
            start_time: window.start_time.format(TIME_FMT).to_string(),
            end_time: window.end_time.format(TIME_FMT).to_string(),
            rrule: window.recurrence.to_string(),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}, {}",
            self.start_time.format(TIME_FMT),
            self.end_time.format(TIME_FMT),
            self.recurrence
        )
    }
}

/// A set of windows. Empty means "always active".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunWindow {
    pub windows: Vec<Window>,
}

impl RunWindow {
    pub fn new(windows: Vec<Window>) -> Self {
        Self { windows }
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn active(&self, now: DateTime<Utc>) -> bool {
        self.windows.is_empty() || self.windows.iter().any(|w| w.active(now))
    }

    /// Encode for storage. The empty set encodes as an empty string.
    pub fn encode(&self) -> String {
        if self.windows.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.windows).unwrap_or_default()
    }

    /// Decode a stored value. Empty input yields the empty set.
    pub fn decode(data: &str) -> Result<Self, RunWindowError> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let windows: Vec<Window> =
            serde_json::from_str(data).map_err(|e| RunWindowError::Json(e.to_string()))?;
        Ok(Self { windows })
    }

    /// Collect every problem with a serialized run window.
    pub fn validate(value: &str) -> Vec<String> {
        if value.trim().is_empty() {
            return Vec::new();
        }

        let data: serde_json::Value = match serde_json::from_str(value) {
            Ok(v) => v,
            Err(e) => return vec![format!("Run window is not valid JSON: {}", e)],
        };
        let Some(entries) = data.as_array() else {
            return vec!["Serialized run window should be list.".to_string()];
        };

        let mut errors = Vec::new();
        for entry in entries {
            let field = |name: &str| entry.get(name).and_then(|v| v.as_str()).unwrap_or("");

            if parse_time(field("start_time")).is_err() || parse_time(field("end_time")).is_err() {
                errors.push("Invalid start/end time.".to_string());
            }

            match field("rrule").parse::<Recurrence>() {
                Ok(_) => {}
                Err(RunWindowError::Rule(msg)) if msg == MISSING_DAYS => {
                    errors.push(format!("You must select at least one day to run on. ({}).", msg));
                }
                Err(e) => errors.push(e.to_string()),
            }
        }
        errors
    }
}

impl fmt::Display for RunWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
