//! Variable-interval scheduling and the trigger sources feeding the pipeline.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, FixedOffset, Timelike, Utc};
use std::time::Duration;

use crate::collab::{FillEvent, QuantInput};
use crate::config::ScheduleConfig;

/// Everything that can start pipeline work. Scheduled ticks and external
/// events go through the same entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Periodic scan of every tracked instrument
    Schedule,
    Fill(FillEvent),
    News { instrument_id: String, ts: u64 },
    /// Scanner found a new high-momentum instrument
    Discovery(QuantInput),
    /// Transport reconnected; slots must be replayed
    Reconnect,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Fill(_) => "fill",
            Trigger::News { .. } => "news",
            Trigger::Discovery(_) => "discovery",
            Trigger::Reconnect => "reconnect",
        }
    }
}

pub fn local_time(ts: u64, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(utc_offset_secs)?;
    let utc: DateTime<Utc> = DateTime::from_timestamp(ts as i64, 0)?;
    Some(utc.with_timezone(&offset))
}

/// Minutes since local midnight, start inclusive, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_min: u32,
    pub end_min: u32,
}

impl Window {
    fn contains(&self, minute: u32) -> bool {
        minute >= self.start_min && minute < self.end_min
    }
}

fn parse_hhmm(s: &str) -> Result<u32> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("expected HH:MM, got {s:?}"))?;
    let h: u32 = h.parse()?;
    let m: u32 = m.parse()?;
    if h > 23 || m > 59 {
        bail!("time out of range: {s:?}");
    }
    Ok(h * 60 + m)
}

/// Parses "HH:MM-HH:MM,HH:MM-HH:MM".
pub fn parse_windows(spec: &str) -> Result<Vec<Window>> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (a, b) = part
            .split_once('-')
            .ok_or_else(|| anyhow!("expected START-END, got {part:?}"))?;
        let w = Window { start_min: parse_hhmm(a)?, end_min: parse_hhmm(b)? };
        if w.end_min <= w.start_min {
            bail!("window ends before it starts: {part:?}");
        }
        out.push(w);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    fast: Duration,
    slow: Duration,
    utc_offset_secs: i32,
    windows: Vec<Window>,
}

impl Scheduler {
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            fast: Duration::from_secs(cfg.fast_secs.max(1)),
            slow: Duration::from_secs(cfg.slow_secs.max(1)),
            utc_offset_secs: cfg.utc_offset_secs,
            windows: parse_windows(&cfg.high_windows)?,
        })
    }

    pub fn is_high_activity(&self, now: u64) -> bool {
        let Some(t) = local_time(now, self.utc_offset_secs) else {
            return false;
        };
        let minute = t.hour() * 60 + t.minute();
        self.windows.iter().any(|w| w.contains(minute))
    }

    pub fn interval_at(&self, now: u64) -> Duration {
        if self.is_high_activity(now) {
            self.fast
        } else {
            self.slow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-04T00:00:00Z, 09:00 at UTC+9
    const NINE_AM_KST: u64 = 1_709_510_400;

    fn scheduler() -> Scheduler {
        Scheduler::from_config(&ScheduleConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_windows() {
        let w = parse_windows("09:00-09:30, 14:50-15:20").unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[0], Window { start_min: 540, end_min: 570 });
        assert!(parse_windows("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_windows() {
        assert!(parse_windows("09:00").is_err());
        assert!(parse_windows("10:00-09:00").is_err());
        assert!(parse_windows("25:00-26:00").is_err());
    }

    #[test]
    fn test_interval_follows_activity_windows() {
        let s = scheduler();
        assert_eq!(s.interval_at(NINE_AM_KST), Duration::from_secs(10));
        assert_eq!(s.interval_at(NINE_AM_KST + 29 * 60), Duration::from_secs(10));
        assert_eq!(s.interval_at(NINE_AM_KST + 30 * 60), Duration::from_secs(60));
        assert_eq!(s.interval_at(NINE_AM_KST + 6 * 3600), Duration::from_secs(10));
        assert_eq!(s.interval_at(NINE_AM_KST - 60), Duration::from_secs(60));
    }
}
