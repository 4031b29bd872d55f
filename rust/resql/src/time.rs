//! Date ranges and the relative presets accepted by the HTTP surface.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive query window. Construction through [`DateRange::new`] guarantees `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(rename = "start_date")]
    pub start: DateTime<Utc>,
    #[serde(rename = "end_date")]
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(ServiceError::invalid(
                "date range start must not be after end",
            ));
        }
        Ok(Self { start, end })
    }

    pub fn last_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: now - Duration::days(days),
            end: now,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    pub fn validate(&self) -> Result<()> {
        Self::new(self.start, self.end).map(|_| ())
    }
}

/// A date range as sent by clients: either explicit bounds or a preset such as `last_7d`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DateRangeInput {
    Preset(String),
    Absolute(DateRange),
}

impl DateRangeInput {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateRange> {
        match self {
            DateRangeInput::Absolute(range) => DateRange::new(range.start, range.end),
            DateRangeInput::Preset(raw) => parse_preset(raw)?.resolve(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelativeRange {
    Hours(i64),
    Days(i64),
    Today,
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl RelativeRange {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateRange> {
        match self {
            RelativeRange::Hours(hours) => DateRange::new(now - Duration::hours(*hours), now),
            RelativeRange::Days(days) => DateRange::new(now - Duration::days(*days), now),
            RelativeRange::Today => {
                let midnight = now.date_naive().and_hms_opt(0, 0, 0).ok_or_else(|| {
                    ServiceError::Internal(anyhow::anyhow!("invalid midnight for {now}"))
                })?;
                DateRange::new(
                    DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc),
                    now,
                )
            }
            RelativeRange::Absolute { start, end } => DateRange::new(*start, *end),
        }
    }
}

pub fn parse_preset(raw: &str) -> Result<RelativeRange> {
    let value = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_lowercase();

    if value.starts_with('[') && value.ends_with(']') {
        return parse_absolute_range(&value);
    }

    if value == "today" {
        return Ok(RelativeRange::Today);
    }

    let normalized = value.replace(['_', '-', ' '], "");
    let normalized = normalized.strip_prefix("last").unwrap_or(&normalized);
    parse_numeric_suffix(normalized)
        .ok_or_else(|| ServiceError::invalid(format!("unsupported date range '{raw}'")))
}

fn parse_numeric_suffix(value: &str) -> Option<RelativeRange> {
    let split = value.find(|ch: char| !ch.is_ascii_digit())?;
    let (digits, suffix) = value.split_at(split);
    let amount: i64 = digits.parse().ok()?;

    match suffix {
        "h" | "hour" | "hours" => Some(RelativeRange::Hours(amount)),
        "d" | "day" | "days" => Some(RelativeRange::Days(amount)),
        _ => None,
    }
}

fn parse_absolute_range(value: &str) -> Result<RelativeRange> {
    let inner = value.trim_matches(['[', ']']);
    let (start_raw, end_raw) = inner
        .split_once(',')
        .ok_or_else(|| ServiceError::invalid("invalid date range"))?;
    Ok(RelativeRange::Absolute {
        start: parse_datetime(start_raw.trim())?,
        end: parse_datetime(end_raw.trim())?,
    })
}

pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
        }
    }
    Err(ServiceError::invalid(format!(
        "invalid time literal '{value}'"
    )))
}
