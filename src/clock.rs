// Wall-clock access for the schedule engine.
//
// The CMS speaks local wall-clock time ("2025-01-31 18:00:00"), without an
// offset, so everything schedule-related works on `PrimitiveDateTime`.

use parking_lot::Mutex;
use time::macros::format_description;
use time::{format_description::BorrowedFormatItem, OffsetDateTime, PrimitiveDateTime};

/// `YYYY-MM-DD HH:MM:SS`, the CMS date format for schedules, stats and logs.
pub const CMS_DATE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
}

/// Local time if the platform can tell us the offset, UTC otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

/// A clock that only moves when told to. Used by tests and replays.
pub struct ManualClock {
    now: Mutex<PrimitiveDateTime>,
}

impl ManualClock {
    pub fn new(now: PrimitiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: PrimitiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut guard = self.now.lock();
        *guard = *guard + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> PrimitiveDateTime {
        *self.now.lock()
    }
}

pub fn parse_cms_date(s: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(s.trim(), CMS_DATE_FORMAT).ok()
}

pub fn format_cms_date(dt: PrimitiveDateTime) -> String {
    dt.format(CMS_DATE_FORMAT).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cms_dates_round_trip_and_reject_garbage() {
        let dt = parse_cms_date("2025-03-17 13:15:24").unwrap();
        assert_eq!(format_cms_date(dt), "2025-03-17 13:15:24");
        assert!(parse_cms_date("17/03/2025").is_none());
        assert!(parse_cms_date("").is_none());
    }
}
