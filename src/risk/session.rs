use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
};
use serde::{Deserialize, Serialize};

/// Exchange trading hours in the exchange's local time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSession {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Offset of exchange local time from UTC, in seconds
    pub utc_offset_secs: i32,
}

impl Default for TradingSession {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            utc_offset_secs: 19_800, // IST, UTC+05:30
        }
    }
}

impl TradingSession {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.offset()).naive_local()
    }

    /// Calendar day used for daily counters
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local_time(now).date()
    }

    /// ISO (year, week) used for weekly counters
    pub fn local_week(&self, now: DateTime<Utc>) -> (i32, u32) {
        let week = self.local_date(now).iso_week();
        (week.year(), week.week())
    }

    /// Whether `now` falls inside trading hours (weekends count as closed)
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = self.local_time(now);
        if local.weekday().number_from_monday() > 5 {
            return false;
        }
        let time = local.time();
        time >= self.open && time < self.close
    }

    /// Minutes to the nearest of open and close, `None` outside trading hours
    pub fn minutes_to_boundary(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.is_open(now) {
            return None;
        }
        let time = self.local_time(now).time();
        let since_open = (time - self.open).num_minutes();
        let to_close = (self.close - time).num_minutes();
        Some(since_open.min(to_close))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ist(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(19_800)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_session_boundaries() {
        let session = TradingSession::default();

        // 2025-10-14 is a Tuesday
        assert!(!session.is_open(ist(2025, 10, 14, 9, 0)));
        assert!(session.is_open(ist(2025, 10, 14, 9, 15)));
        assert_eq!(session.minutes_to_boundary(ist(2025, 10, 14, 9, 25)), Some(10));
        assert_eq!(session.minutes_to_boundary(ist(2025, 10, 14, 12, 0)), Some(165));
        assert_eq!(session.minutes_to_boundary(ist(2025, 10, 14, 15, 20)), Some(10));
        assert!(!session.is_open(ist(2025, 10, 14, 15, 30)));

        // Saturday
        assert!(!session.is_open(ist(2025, 10, 18, 11, 0)));
    }

    #[test]
    fn test_local_date_uses_exchange_offset() {
        let session = TradingSession::default();
        // 20:00 UTC on the 14th is already the 15th in IST
        let now = Utc.with_ymd_and_hms(2025, 10, 14, 20, 0, 0).unwrap();
        assert_eq!(session.local_date(now), NaiveDate::from_ymd_opt(2025, 10, 15).unwrap());
    }
}
