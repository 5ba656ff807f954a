use chrono::{Datelike, TimeZone, Utc};
use mongodb::bson::DateTime;
#[cfg(test)]
use std::sync::Mutex;

use crate::services::{ServiceError, ServiceResult};

/// Source of "now" for the services.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime {
        DateTime::now()
    }
}

/// Settable clock for tests.
#[cfg(test)]
pub struct FixedClock {
    now: Mutex<DateTime>,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(now: DateTime) -> Self {
        FixedClock { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance_millis(&self, millis: i64) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = DateTime::from_millis(guard.timestamp_millis() + millis);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_utc(ts: DateTime) -> chrono::DateTime<Utc> {
    // bson DateTime covers a wider range than chrono
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or_default()
}

/// Canonical usage period key (`YYYY-MM`, UTC) for a timestamp.
pub fn period_key(ts: DateTime) -> String {
    let utc = to_utc(ts);
    format!("{:04}-{:02}", utc.year(), utc.month())
}

/// Day key (`YYYY-MM-DD`, UTC), used for per-day limits.
pub fn day_key(ts: DateTime) -> String {
    let utc = to_utc(ts);
    format!("{:04}-{:02}-{:02}", utc.year(), utc.month(), utc.day())
}

/// Validates a caller-supplied period key and returns it normalized.
pub fn parse_period(raw: &str) -> ServiceResult<String> {
    let raw = raw.trim();
    let invalid = || ServiceError::validation(format!("Invalid period '{}', expected YYYY-MM", raw));

    let (year, month) = raw.split_once('-').ok_or_else(invalid)?;
    if year.len() != 4 || month.len() != 2 {
        return Err(invalid());
    }

    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) {
        return Err(invalid());
    }

    Ok(format!("{:04}-{:02}", year, month))
}

#[cfg(test)]
pub fn utc_datetime(year: i32, month: u32, day: u32) -> Option<DateTime> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .map(|dt| DateTime::from_millis(dt.timestamp_millis()))
}

pub fn to_bson(ts: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(ts.timestamp_millis())
}

pub fn to_rfc3339(ts: DateTime) -> String {
    to_utc(ts).to_rfc3339()
}
