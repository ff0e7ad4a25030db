use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// A parsed recurrence expression bound to the timezone it is evaluated in.
///
/// Accepts standard 5-field cron (`min hour dom month dow`), the 6/7-field
/// form with leading seconds (and trailing year), and the `@hourly`-style
/// shorthands understood by the `cron` crate.
#[derive(Debug, Clone)]
pub struct SyncSchedule {
    expression: String,
    timezone: Tz,
    cron: cron::Schedule,
}

impl SyncSchedule {
    /// Parse `expression` in `timezone` (IANA name, empty means UTC).
    ///
    /// Expressions that can never fire (e.g. 30 February) are rejected too.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let tz = parse_timezone(timezone)?;
        let normalized = normalize(expression)?;
        let cron = cron::Schedule::from_str(&normalized).map_err(|e| {
            SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        let schedule = Self {
            expression: expression.trim().to_string(),
            timezone: tz,
            cron,
        };
        if schedule.next_after(Utc::now()).is_none() {
            return Err(SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                reason: "expression has no upcoming occurrence".to_string(),
            });
        }
        Ok(schedule)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First occurrence strictly after `after`, in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn parse_timezone(timezone: &str) -> Result<Tz> {
    let name = timezone.trim();
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// The `cron` crate wants a seconds field; classic 5-field expressions get
/// `0` prepended.
fn normalize(expression: &str) -> Result<String> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 | 7 => Ok(trimmed.to_string()),
        n => Err(SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: format!("expected 5, 6 or 7 fields, got {n}"),
        }),
    }
}
