// ABOUTME: Trigger specifications for the scheduler - one-shot, fixed interval, or cron with timezone
// ABOUTME: Cron expressions accept 5 or 6 fields and an optional trailing IANA timezone

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::ConfigError;

/// When cycles fire.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Exactly one cycle, then stop.
    Once,
    /// Every `Duration`, starting immediately.
    Interval(Duration),
    /// On each cron fire time.
    Cron(CronSchedule),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Once => f.write_str("once"),
            Trigger::Interval(d) => write!(f, "every {}s", d.as_secs()),
            Trigger::Cron(c) => write!(f, "cron `{}`", c),
        }
    }
}

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse `"<fields> [Timezone]"`.
    ///
    /// Five fields (`min hour dom month dow`) get a leading `0` seconds field;
    /// six or seven fields are passed to the cron parser unchanged.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSchedule(spec.to_string(), reason);

        let mut tokens: Vec<&str> = spec.split_whitespace().collect();
        let timezone = match tokens.last().map(|t| t.parse::<Tz>()) {
            Some(Ok(tz)) => {
                tokens.pop();
                tz
            }
            _ => Tz::UTC,
        };

        let expression = match tokens.len() {
            5 => format!("0 {}", tokens.join(" ")),
            6 | 7 => tokens.join(" "),
            n => return Err(invalid(format!("expected 5 or 6 fields, found {}", n))),
        };

        let schedule =
            cron::Schedule::from_str(&expression).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression,
            schedule,
            timezone,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expression, self.timezone.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_five_fields_defaults_to_utc() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(s.timezone(), Tz::UTC);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 3, 10).unwrap();
        assert_eq!(
            s.next_after(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_with_timezone() {
        let s = CronSchedule::parse("0 6 * * * Asia/Tokyo").unwrap();
        assert_eq!(s.timezone(), Tz::Asia__Tokyo);
        // 06:00 JST is 21:00 UTC the previous day.
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            s.next_after(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 21, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_six_fields() {
        let s = CronSchedule::parse("30 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            s.next_after(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 30).unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CronSchedule::parse("").is_err());
        assert!(CronSchedule::parse("* *").is_err());
        assert!(CronSchedule::parse("99 * * * *").is_err());
        assert!(CronSchedule::parse("* * * * * Mars/Olympus").is_err());
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::Once.to_string(), "once");
        assert_eq!(Trigger::Interval(Duration::from_secs(60)).to_string(), "every 60s");
    }
}
