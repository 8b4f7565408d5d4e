//! Market-hours window and next-run arithmetic.
//!
//! A validated view of [`ScheduleConfig`]: the stored strings are parsed
//! once here, so every malformed schedule is rejected before it is saved.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::{CoordinatorError, ScheduleConfig};

/// How far `next_run_after` may roll forward looking for an open day.
const MAX_ROLL_DAYS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePolicy {
    tz: Tz,
    start: NaiveTime,
    end: NaiveTime,
    excluded: Vec<Weekday>,
    interval: Duration,
    market_hours_only: bool,
}

fn invalid(msg: impl Into<String>) -> CoordinatorError {
    CoordinatorError::Configuration(msg.into())
}

fn parse_clock(field: &str, value: &str) -> Result<NaiveTime, CoordinatorError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| invalid(format!("{field} must be HH:MM, got {value:?}")))
}

impl SchedulePolicy {
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self, CoordinatorError> {
        if cfg.interval_minutes == 0 {
            return Err(invalid("interval_minutes must be at least 1"));
        }
        let tz: Tz = cfg
            .timezone
            .parse()
            .map_err(|_| invalid(format!("unknown timezone {:?}", cfg.timezone)))?;
        let start = parse_clock("start_time", &cfg.start_time)?;
        let end = parse_clock("end_time", &cfg.end_time)?;
        if start >= end {
            return Err(invalid(format!(
                "start_time {} must be before end_time {}",
                cfg.start_time, cfg.end_time
            )));
        }

        let mut excluded = Vec::new();
        for day in &cfg.excluded_days {
            let weekday: Weekday = day
                .trim()
                .parse()
                .map_err(|_| invalid(format!("unknown weekday {day:?}")))?;
            if !excluded.contains(&weekday) {
                excluded.push(weekday);
            }
        }
        if excluded.len() >= 7 {
            return Err(invalid("every weekday is excluded"));
        }

        Ok(Self {
            tz,
            start,
            end,
            excluded,
            interval: Duration::minutes(i64::from(cfg.interval_minutes)),
            market_hours_only: cfg.market_hours_only,
        })
    }

    pub fn market_hours_only(&self) -> bool {
        self.market_hours_only
    }

    /// Whether `now` falls on an allowed day between open and close (inclusive).
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        !self.excluded.contains(&local.weekday())
            && local.time() >= self.start
            && local.time() <= self.end
    }

    /// `now + interval`, rolled forward to the next open slot when the
    /// schedule is restricted to market hours.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = now + self.interval;
        if !self.market_hours_only {
            return candidate;
        }

        let mut local = candidate.with_timezone(&self.tz);
        for _ in 0..MAX_ROLL_DAYS * 2 {
            let date = local.date_naive();
            let next_open = |day: NaiveDate| day.succ_opt().and_then(|d| self.open_on(d));

            if self.excluded.contains(&date.weekday()) || local.time() > self.end {
                match next_open(date) {
                    Some(open) => local = open,
                    None => break,
                }
            } else if local.time() < self.start {
                match self.open_on(date) {
                    Some(open) => local = open,
                    None => break,
                }
            } else {
                return local.with_timezone(&Utc);
            }
        }

        warn!(candidate = %candidate, "No open market slot found, using plain interval");
        candidate
    }

    /// Local market open on `date`; shifted past a DST gap if it falls in one.
    fn open_on(&self, date: NaiveDate) -> Option<DateTime<Tz>> {
        let naive = date.and_time(self.start);
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| self.tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
    }
}
