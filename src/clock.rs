//! Wall clock capability and user-timezone formatting.
//!
//! Everything time-sensitive in the engine (digest window, cadence checks,
//! timeout reaping) goes through `Clock` so tests can drive a fixed clock.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `HH:mm` in the given timezone.
pub fn local_hhmm(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%H:%M").to_string()
}

/// `yyyy-MM-dd` in the given timezone.
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_local_formatting_crosses_midnight() {
        // 2024-01-16 02:30 UTC is 2024-01-15 21:30 in New York (UTC-5).
        let now = Utc.with_ymd_and_hms(2024, 1, 16, 2, 30, 0).unwrap();
        let tz = chrono_tz::America::New_York;
        assert_eq!(local_hhmm(now, tz), "21:30");
        assert_eq!(local_date(now, tz), "2024-01-15");
    }

    #[test]
    fn test_local_formatting_utc() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 5, 0).unwrap();
        assert_eq!(local_hhmm(now, chrono_tz::UTC), "09:05");
        assert_eq!(local_date(now, chrono_tz::UTC), "2024-06-01");
    }
}
