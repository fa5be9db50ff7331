use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

use crate::schedule::local_time;

/// Static per-instrument event dates, in exchange-local time.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCalendar {
    dilution_days: HashMap<String, HashSet<NaiveDate>>,
    utc_offset_secs: i32,
}

impl ReferenceCalendar {
    pub fn new(utc_offset_secs: i32) -> Self {
        Self { dilution_days: HashMap::new(), utc_offset_secs }
    }

    /// New-share listing, rights issue or convertible conversion dates.
    pub fn add_dilution_day(&mut self, instrument_id: &str, day: NaiveDate) {
        self.dilution_days.entry(instrument_id.to_string()).or_default().insert(day);
    }

    pub fn local_date(&self, ts: u64) -> Option<NaiveDate> {
        local_time(ts, self.utc_offset_secs).map(|t| t.date_naive())
    }

    pub fn is_dilution_day(&self, instrument_id: &str, ts: u64) -> bool {
        let Some(day) = self.local_date(ts) else {
            return false;
        };
        self.dilution_days
            .get(instrument_id)
            .map(|days| days.contains(&day))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dilution_day_uses_local_date() {
        let mut cal = ReferenceCalendar::new(9 * 3600);
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        cal.add_dilution_day("A", day);
        // 2024-03-03T23:30:00Z is 08:30 on 2024-03-04 at UTC+9
        let ts = 1_709_508_600;
        assert!(cal.is_dilution_day("A", ts));
        assert!(!cal.is_dilution_day("B", ts));
        assert!(!cal.is_dilution_day("A", ts - 86_400));
    }
}
