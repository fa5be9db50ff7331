//! System-wide trading gate: NORMAL / SAFE / HALT.
//!
//! Escalation is one-directional. SAFE falls back to NORMAL only after a
//! full cooldown with no new errors and with the loss triggers cleared;
//! HALT is left only through `manual_reset`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::config::SafetyConfig;
use crate::logging::{log, log_safety_transition, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyMode {
    Normal,
    Safe,
    Halt,
}

impl SafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyMode::Normal => "NORMAL",
            SafetyMode::Safe => "SAFE",
            SafetyMode::Halt => "HALT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    NewEntry,
    Pyramid,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyState {
    pub mode: SafetyMode,
    /// Consecutive upstream-call failures
    pub api_error_count: u32,
    pub consecutive_loss_count: u32,
    pub daily_realized_pnl: f64,
    pub daily_loss_pct: f64,
    pub mode_started_at: u64,
    pub last_error_at: Option<u64>,
    pub trading_day: Option<NaiveDate>,
    pub last_trigger: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SafetyMode,
    pub to: SafetyMode,
    pub trigger: String,
}

impl SafetyState {
    pub fn new(now: u64) -> Self {
        Self {
            mode: SafetyMode::Normal,
            api_error_count: 0,
            consecutive_loss_count: 0,
            daily_realized_pnl: 0.0,
            daily_loss_pct: 0.0,
            mode_started_at: now,
            last_error_at: None,
            trading_day: None,
            last_trigger: String::new(),
        }
    }

    pub fn permits(&self, action: ActionKind) -> bool {
        match self.mode {
            SafetyMode::Normal => true,
            SafetyMode::Safe => action == ActionKind::Exit,
            SafetyMode::Halt => false,
        }
    }

    fn escalate(&mut self, to: SafetyMode, trigger: &str, now: u64) -> Option<Transition> {
        if to <= self.mode {
            return None;
        }
        let from = self.mode;
        self.mode = to;
        self.mode_started_at = now;
        self.last_trigger = trigger.to_string();
        Some(Transition { from, to, trigger: trigger.to_string() })
    }

    pub fn record_api_error(&mut self, now: u64, cfg: &SafetyConfig) -> Option<Transition> {
        self.api_error_count += 1;
        self.last_error_at = Some(now);
        if self.api_error_count >= cfg.max_api_errors {
            return self.escalate(SafetyMode::Safe, "api_errors", now);
        }
        None
    }

    pub fn record_api_success(&mut self) {
        self.api_error_count = 0;
    }

    pub fn record_store_failure(&mut self, now: u64) -> Option<Transition> {
        self.last_error_at = Some(now);
        self.escalate(SafetyMode::Safe, "store_failure", now)
    }

    pub fn record_realized_pnl(&mut self, pnl: f64, now: u64, cfg: &SafetyConfig) -> Option<Transition> {
        self.daily_realized_pnl += pnl;
        if pnl < 0.0 {
            self.consecutive_loss_count += 1;
        } else if pnl > 0.0 {
            self.consecutive_loss_count = 0;
        }
        self.daily_loss_pct = if cfg.account_equity > 0.0 {
            (-self.daily_realized_pnl).max(0.0) / cfg.account_equity * 100.0
        } else {
            0.0
        };

        if self.daily_loss_pct >= cfg.halt_loss_pct {
            return self.escalate(SafetyMode::Halt, "daily_loss_halt", now);
        }
        if self.daily_loss_pct >= cfg.safe_loss_pct {
            return self.escalate(SafetyMode::Safe, "daily_loss", now);
        }
        if self.consecutive_loss_count >= cfg.max_consecutive_losses {
            return self.escalate(SafetyMode::Safe, "consecutive_losses", now);
        }
        None
    }

    fn loss_triggers_clear(&self, cfg: &SafetyConfig) -> bool {
        self.daily_loss_pct < cfg.safe_loss_pct && self.consecutive_loss_count < cfg.max_consecutive_losses
    }

    /// SAFE → NORMAL once `cooldown_secs` have passed since both the mode
    /// change and the last error.
    pub fn tick(&mut self, now: u64, cfg: &SafetyConfig) -> Option<Transition> {
        if self.mode != SafetyMode::Safe {
            return None;
        }
        let quiet_since = self.last_error_at.map_or(self.mode_started_at, |e| e.max(self.mode_started_at));
        if now.saturating_sub(quiet_since) < cfg.cooldown_secs || !self.loss_triggers_clear(cfg) {
            return None;
        }
        self.mode = SafetyMode::Normal;
        self.mode_started_at = now;
        self.api_error_count = 0;
        self.last_trigger = "cooldown".to_string();
        Some(Transition { from: SafetyMode::Safe, to: SafetyMode::Normal, trigger: "cooldown".to_string() })
    }

    /// Resets the daily counters when `day` is a new trading day. Mode is untouched.
    pub fn roll_day(&mut self, day: NaiveDate) -> bool {
        if self.trading_day == Some(day) {
            return false;
        }
        let first = self.trading_day.is_none();
        self.trading_day = Some(day);
        if first {
            return false;
        }
        self.daily_realized_pnl = 0.0;
        self.daily_loss_pct = 0.0;
        self.consecutive_loss_count = 0;
        true
    }

    pub fn manual_reset(&mut self, now: u64) -> Option<Transition> {
        let from = self.mode;
        self.mode = SafetyMode::Normal;
        self.mode_started_at = now;
        self.api_error_count = 0;
        self.consecutive_loss_count = 0;
        self.daily_realized_pnl = 0.0;
        self.daily_loss_pct = 0.0;
        self.last_error_at = None;
        self.last_trigger = "manual_reset".to_string();
        if from == SafetyMode::Normal {
            return None;
        }
        Some(Transition { from, to: SafetyMode::Normal, trigger: "manual_reset".to_string() })
    }
}

/// Mutex-guarded `SafetyState` shared across pipeline runs; logs every transition.
pub struct SafetyGate {
    cfg: SafetyConfig,
    state: Mutex<SafetyState>,
}

impl SafetyGate {
    pub fn new(cfg: SafetyConfig, now: u64) -> Self {
        Self { cfg, state: Mutex::new(SafetyState::new(now)) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SafetyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(t: Option<Transition>) -> Option<Transition> {
        if let Some(t) = &t {
            log_safety_transition(t.from.as_str(), t.to.as_str(), &t.trigger);
        }
        t
    }

    pub fn restore(&self, state: SafetyState) {
        *self.lock() = state;
    }

    pub fn snapshot(&self) -> SafetyState {
        self.lock().clone()
    }

    pub fn mode(&self) -> SafetyMode {
        self.lock().mode
    }

    pub fn permits(&self, action: ActionKind) -> bool {
        self.lock().permits(action)
    }

    pub fn record_api_error(&self, now: u64) -> Option<Transition> {
        let t = self.lock().record_api_error(now, &self.cfg);
        Self::report(t)
    }

    pub fn record_api_success(&self) {
        self.lock().record_api_success();
    }

    pub fn record_store_failure(&self, now: u64) -> Option<Transition> {
        let t = self.lock().record_store_failure(now);
        Self::report(t)
    }

    pub fn record_realized_pnl(&self, pnl: f64, now: u64) -> Option<Transition> {
        let t = self.lock().record_realized_pnl(pnl, now, &self.cfg);
        Self::report(t)
    }

    pub fn tick(&self, now: u64) -> Option<Transition> {
        let t = self.lock().tick(now, &self.cfg);
        Self::report(t)
    }

    pub fn roll_day(&self, day: NaiveDate) -> bool {
        self.lock().roll_day(day)
    }

    /// Operator action; the only way out of HALT.
    pub fn manual_reset(&self, now: u64) -> Option<Transition> {
        let mut state = self.lock();
        let before = state.clone();
        let t = state.manual_reset(now);
        drop(state);
        log(
            Level::Warn,
            Domain::Audit,
            "safety_manual_reset",
            obj(&[
                ("from", v_str(before.mode.as_str())),
                ("api_error_count", v_num(before.api_error_count as f64)),
                ("consecutive_loss_count", v_num(before.consecutive_loss_count as f64)),
                ("daily_loss_pct", v_num(before.daily_loss_pct)),
            ]),
        );
        Self::report(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SafetyConfig {
        SafetyConfig {
            max_api_errors: 3,
            max_consecutive_losses: 3,
            safe_loss_pct: 2.0,
            halt_loss_pct: 5.0,
            cooldown_secs: 600,
            account_equity: 1_000_000.0,
        }
    }

    #[test]
    fn test_safe_blocks_entries_but_permits_exits() {
        let mut s = SafetyState::new(0);
        s.record_store_failure(10);
        assert_eq!(s.mode, SafetyMode::Safe);
        assert!(!s.permits(ActionKind::NewEntry));
        assert!(!s.permits(ActionKind::Pyramid));
        assert!(s.permits(ActionKind::Exit));
    }

    #[test]
    fn test_halt_permits_nothing() {
        let mut s = SafetyState::new(0);
        s.record_realized_pnl(-60_000.0, 10, &cfg());
        assert_eq!(s.mode, SafetyMode::Halt);
        for a in [ActionKind::NewEntry, ActionKind::Pyramid, ActionKind::Exit] {
            assert!(!s.permits(a));
        }
    }

    #[test]
    fn test_api_errors_escalate_at_threshold() {
        let mut s = SafetyState::new(0);
        assert!(s.record_api_error(1, &cfg()).is_none());
        s.record_api_success();
        s.record_api_error(2, &cfg());
        s.record_api_error(3, &cfg());
        assert_eq!(s.mode, SafetyMode::Normal);
        let t = s.record_api_error(4, &cfg()).unwrap();
        assert_eq!(t.to, SafetyMode::Safe);
        assert_eq!(t.trigger, "api_errors");
    }

    #[test]
    fn test_daily_loss_thresholds() {
        let mut s = SafetyState::new(0);
        s.record_realized_pnl(-25_000.0, 1, &cfg());
        assert_eq!(s.mode, SafetyMode::Safe);
        // SAFE may still escalate to HALT
        let t = s.record_realized_pnl(-30_000.0, 2, &cfg()).unwrap();
        assert_eq!(t.from, SafetyMode::Safe);
        assert_eq!(t.to, SafetyMode::Halt);
    }

    #[test]
    fn test_consecutive_losses_escalate_and_gains_reset() {
        let mut s = SafetyState::new(0);
        s.record_realized_pnl(-10.0, 1, &cfg());
        s.record_realized_pnl(-10.0, 2, &cfg());
        s.record_realized_pnl(50.0, 3, &cfg());
        s.record_realized_pnl(-10.0, 4, &cfg());
        assert_eq!(s.mode, SafetyMode::Normal);
        s.record_realized_pnl(-10.0, 5, &cfg());
        s.record_realized_pnl(-10.0, 6, &cfg());
        assert_eq!(s.mode, SafetyMode::Safe);
    }

    #[test]
    fn test_cooldown_requires_quiet_window() {
        let c = cfg();
        let mut s = SafetyState::new(0);
        s.record_store_failure(100);
        assert!(s.tick(650, &c).is_none());
        s.record_api_error(650, &c);
        // 600s after the mode change but only 50s after the last error
        assert!(s.tick(700, &c).is_none());
        let t = s.tick(1250, &c).unwrap();
        assert_eq!(t.to, SafetyMode::Normal);
        assert_eq!(s.api_error_count, 0);
    }

    #[test]
    fn test_cooldown_waits_for_loss_triggers() {
        let c = cfg();
        let mut s = SafetyState::new(0);
        s.record_realized_pnl(-25_000.0, 0, &c);
        assert!(s.tick(10_000, &c).is_none());
        s.roll_day(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        s.roll_day(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(s.daily_loss_pct, 0.0);
        assert!(s.tick(10_001, &c).is_some());
    }

    #[test]
    fn test_halt_never_auto_clears() {
        let c = cfg();
        let mut s = SafetyState::new(0);
        s.record_realized_pnl(-60_000.0, 0, &c);
        s.roll_day(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        s.roll_day(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        for now in [1_000, 100_000, 10_000_000] {
            assert!(s.tick(now, &c).is_none());
            s.record_api_success();
            s.record_realized_pnl(1_000.0, now, &c);
        }
        assert_eq!(s.mode, SafetyMode::Halt);
        let t = s.manual_reset(20_000_000).unwrap();
        assert_eq!(t.from, SafetyMode::Halt);
        assert_eq!(s.mode, SafetyMode::Normal);
    }

    #[test]
    fn test_roll_day_first_call_only_records() {
        let mut s = SafetyState::new(0);
        s.record_realized_pnl(-10.0, 0, &cfg());
        assert!(!s.roll_day(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
        assert_eq!(s.consecutive_loss_count, 1);
        assert!(s.roll_day(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()));
        assert_eq!(s.consecutive_loss_count, 0);
    }

    #[test]
    fn test_gate_state_serializes() {
        let gate = SafetyGate::new(cfg(), 0);
        gate.record_store_failure(5);
        let json = serde_json::to_string(&gate.snapshot()).unwrap();
        let back: SafetyState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, SafetyMode::Safe);
        assert!(json.contains("\"SAFE\""));
    }
}
