//! C10: market-open predicate for the NSE intraday session.

use chrono::{Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};

const IST_OFFSET_SECONDS: i32 = 5 * 3600 + 30 * 60;
const MARKET_OPEN: (u32, u32) = (9, 15);
const MARKET_CLOSE: (u32, u32) = (15, 30);

#[derive(Debug, Clone, Copy, Default)]
pub struct MarketClock;

impl MarketClock {
    pub fn new() -> Self {
        Self
    }

    /// True only on weekdays (Mon-Fri) within [09:15, 15:30] IST. Any
    /// internal error (e.g. an unrepresentable offset) returns false.
    pub fn is_market_open(&self) -> bool {
        let Some(ist) = FixedOffset::east_opt(IST_OFFSET_SECONDS) else {
            return false;
        };
        let now = Utc::now().with_timezone(&ist);

        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let Some(open) = NaiveTime::from_hms_opt(MARKET_OPEN.0, MARKET_OPEN.1, 0) else {
            return false;
        };
        let Some(close) = NaiveTime::from_hms_opt(MARKET_CLOSE.0, MARKET_CLOSE.1, 0) else {
            return false;
        };

        let now_time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second());
        let Some(now_time) = now_time else {
            return false;
        };

        now_time >= open && now_time <= close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn is_open_at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> bool {
        let ist = FixedOffset::east_opt(IST_OFFSET_SECONDS).unwrap();
        let dt = ist
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .unwrap();
        let weekday_ok = !matches!(dt.weekday(), Weekday::Sat | Weekday::Sun);
        let open = NaiveTime::from_hms_opt(MARKET_OPEN.0, MARKET_OPEN.1, 0).unwrap();
        let close = NaiveTime::from_hms_opt(MARKET_CLOSE.0, MARKET_CLOSE.1, 0).unwrap();
        let t = NaiveTime::from_hms_opt(hour, minute, 0).unwrap();
        weekday_ok && t >= open && t <= close
    }

    #[test]
    fn boundaries_are_inclusive_on_a_weekday() {
        // 2024-01-02 is a Tuesday.
        assert!(is_open_at(2024, 1, 2, 9, 15));
        assert!(is_open_at(2024, 1, 2, 15, 30));
        assert!(!is_open_at(2024, 1, 2, 9, 14));
        assert!(!is_open_at(2024, 1, 2, 15, 31));
    }

    #[test]
    fn closed_on_weekend() {
        // 2024-01-06 is a Saturday.
        assert!(!is_open_at(2024, 1, 6, 10, 0));
    }
}
