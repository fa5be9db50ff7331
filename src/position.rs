//! Position lifecycle: staged entries, staged exits, trailing stop.
//!
//! Entry stages advance 1 → 2 → 3 on profit triggers measured from the
//! previous stage's fill price. Exits go HOLDING → PARTIAL_EXIT_1 →
//! FULL_EXIT. Every evaluation checks, in order: stop-loss, trailing stop,
//! partial exit, pyramiding. The first that fires wins.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::config::PositionConfig;
use crate::consensus::sizing::tranche;

pub const EXIT_HOLDING: u8 = 0;
pub const EXIT_PARTIAL: u8 = 1;
pub const EXIT_FULL: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: String,
    pub entry_stage: u8,
    pub exit_stage: u8,
    pub quantity: u64,
    pub avg_cost: f64,
    pub highest_price_seen: f64,
    pub partial_exit_done: bool,
    /// Total quantity the consensus validator sized for all three stages
    pub planned_quantity: u64,
    /// Fill price of the most recent entry stage; pyramid triggers measure from here
    pub stage_ref_price: f64,
    pub entry_quant_score: f64,
    pub entry_ai_score: f64,
    pub opened_at: u64,
    /// Sum of buy notional, the denominator of the realized return
    pub invested: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionAction {
    None,
    StopLoss { qty: u64 },
    TrailingStop { qty: u64, stop_price: f64 },
    PartialExit { qty: u64 },
    Pyramid { stage: u8, qty: u64 },
}

impl PositionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionAction::None => "none",
            PositionAction::StopLoss { .. } => "stop_loss",
            PositionAction::TrailingStop { .. } => "trailing_stop",
            PositionAction::PartialExit { .. } => "partial_exit",
            PositionAction::Pyramid { .. } => "pyramid",
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            PositionAction::StopLoss { .. } | PositionAction::TrailingStop { .. } | PositionAction::PartialExit { .. }
        )
    }
}

/// What an order was for, so its fill can be applied to the right transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillIntent {
    Entry,
    Pyramid { stage: u8 },
    PartialExit,
    FullExit,
}

impl FillIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillIntent::Entry => "entry",
            FillIntent::Pyramid { .. } => "pyramid",
            FillIntent::PartialExit => "partial_exit",
            FillIntent::FullExit => "full_exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub instrument_id: String,
    pub entry_quant_score: f64,
    pub entry_ai_score: f64,
    pub realized_pnl: f64,
    pub return_pct: f64,
    pub opened_at: u64,
    pub closed_at: u64,
}

impl Position {
    /// Stage-1 fill.
    pub fn open(
        instrument_id: &str,
        planned_quantity: u64,
        price: f64,
        qty: u64,
        quant_score: f64,
        ai_score: f64,
        ts: u64,
    ) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            entry_stage: 1,
            exit_stage: EXIT_HOLDING,
            quantity: qty,
            avg_cost: price,
            highest_price_seen: price,
            partial_exit_done: false,
            planned_quantity,
            stage_ref_price: price,
            entry_quant_score: quant_score,
            entry_ai_score: ai_score,
            opened_at: ts,
            invested: price * qty as f64,
            realized_pnl: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.quantity > 0
    }

    pub fn gain_pct(&self, price: f64) -> f64 {
        if self.avg_cost <= 0.0 {
            return 0.0;
        }
        (price / self.avg_cost - 1.0) * 100.0
    }

    pub fn peak_gain_pct(&self) -> f64 {
        self.gain_pct(self.highest_price_seen)
    }

    /// Raises the high-water mark; never lowers it.
    pub fn observe(&mut self, price: f64) {
        if price.is_finite() && price > self.highest_price_seen {
            self.highest_price_seen = price;
        }
    }

    /// Trailing stop price, once peak gain has reached the activation floor.
    pub fn trailing_stop(&self, cfg: &PositionConfig) -> Option<f64> {
        let peak = self.peak_gain_pct();
        if peak < cfg.trail_activate_pct {
            return None;
        }
        let distance = if peak >= cfg.trail_tight_from_pct {
            cfg.trail_tight_pct
        } else {
            cfg.trail_wide_pct
        };
        Some(self.highest_price_seen * (1.0 - distance / 100.0))
    }

    pub fn evaluate(&mut self, price: f64, cfg: &PositionConfig) -> PositionAction {
        if !self.is_open() || !price.is_finite() || price <= 0.0 {
            return PositionAction::None;
        }
        self.observe(price);
        let gain = self.gain_pct(price);

        if gain <= -cfg.stop_loss_pct {
            return PositionAction::StopLoss { qty: self.quantity };
        }

        if let Some(stop_price) = self.trailing_stop(cfg) {
            if price <= stop_price {
                return PositionAction::TrailingStop { qty: self.quantity, stop_price };
            }
        }

        if !self.partial_exit_done && gain >= cfg.partial_exit_pct && self.quantity >= 2 {
            let qty = tranche(self.quantity, cfg.partial_exit_fraction).max(1);
            return PositionAction::PartialExit { qty };
        }

        if !self.partial_exit_done && (1..3).contains(&self.entry_stage) {
            let trigger = if self.entry_stage == 1 { cfg.stage2_gain_pct } else { cfg.stage3_gain_pct };
            if price >= self.stage_ref_price * (1.0 + trigger / 100.0) {
                let next = self.entry_stage + 1;
                let qty = tranche(self.planned_quantity, cfg.entry_fractions[(next - 1) as usize]);
                if qty > 0 {
                    return PositionAction::Pyramid { stage: next, qty };
                }
            }
        }

        PositionAction::None
    }

    /// Pyramid fill. Stages only move forward; a stale or repeated stage fill
    /// still adds quantity but leaves the stage where it is.
    pub fn apply_buy(&mut self, price: f64, qty: u64, stage: u8) {
        if qty == 0 {
            return;
        }
        let total = self.quantity + qty;
        self.avg_cost = (self.avg_cost * self.quantity as f64 + price * qty as f64) / total as f64;
        self.quantity = total;
        self.invested += price * qty as f64;
        if stage > self.entry_stage && stage <= 3 {
            self.entry_stage = stage;
            self.stage_ref_price = price;
        }
        self.observe(price);
    }

    /// Sell fill; returns the realized pnl of this fill.
    pub fn apply_sell(&mut self, price: f64, qty: u64, partial: bool) -> f64 {
        let qty = qty.min(self.quantity);
        let pnl = (price - self.avg_cost) * qty as f64;
        self.quantity -= qty;
        self.realized_pnl += pnl;
        if self.quantity == 0 {
            self.exit_stage = EXIT_FULL;
        } else if partial {
            self.partial_exit_done = true;
            self.exit_stage = EXIT_PARTIAL;
        }
        pnl
    }

    pub fn realized_return_pct(&self) -> f64 {
        if self.invested <= 0.0 {
            return 0.0;
        }
        self.realized_pnl / self.invested * 100.0
    }

    fn close(&self, ts: u64) -> ClosedPosition {
        ClosedPosition {
            instrument_id: self.instrument_id.clone(),
            entry_quant_score: self.entry_quant_score,
            entry_ai_score: self.entry_ai_score,
            realized_pnl: self.realized_pnl,
            return_pct: self.realized_return_pct(),
            opened_at: self.opened_at,
            closed_at: ts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    pub position: Option<Position>,
    pub realized_pnl: f64,
    pub closed: Option<ClosedPosition>,
}

/// Scores carried from the decision that sized an entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryPlan {
    pub planned_quantity: u64,
    pub quant_score: f64,
    pub ai_score: f64,
}

/// Open positions, keyed by instrument id.
#[derive(Default)]
pub struct PositionBook {
    positions: Mutex<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Position>> {
        self.positions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn restore(&self, positions: Vec<Position>) {
        let mut map = self.lock();
        map.clear();
        for p in positions.into_iter().filter(|p| p.is_open()) {
            map.insert(p.instrument_id.clone(), p);
        }
    }

    pub fn get(&self, instrument_id: &str) -> Option<Position> {
        self.lock().get(instrument_id).cloned()
    }

    pub fn contains(&self, instrument_id: &str) -> bool {
        self.lock().contains_key(instrument_id)
    }

    pub fn held_ids(&self) -> HashSet<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Position> {
        let mut v: Vec<Position> = self.lock().values().cloned().collect();
        v.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
        v
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs `evaluate` under the book lock, returning the updated position.
    pub fn evaluate(&self, instrument_id: &str, price: f64, cfg: &PositionConfig) -> Option<(PositionAction, Position)> {
        let mut map = self.lock();
        let pos = map.get_mut(instrument_id)?;
        let action = pos.evaluate(price, cfg);
        Some((action, pos.clone()))
    }

    pub fn apply_fill(
        &self,
        instrument_id: &str,
        intent: FillIntent,
        price: f64,
        qty: u64,
        plan: Option<EntryPlan>,
        ts: u64,
    ) -> FillOutcome {
        let mut map = self.lock();
        match intent {
            FillIntent::Entry => {
                let pos = match map.remove(instrument_id) {
                    // A second entry fill for the same order sizing tops up stage 1.
                    Some(mut existing) => {
                        existing.apply_buy(price, qty, existing.entry_stage);
                        existing
                    }
                    None => {
                        let plan = plan.unwrap_or(EntryPlan { planned_quantity: qty, quant_score: 0.0, ai_score: 0.0 });
                        Position::open(instrument_id, plan.planned_quantity, price, qty, plan.quant_score, plan.ai_score, ts)
                    }
                };
                map.insert(instrument_id.to_string(), pos.clone());
                FillOutcome { position: Some(pos), realized_pnl: 0.0, closed: None }
            }
            FillIntent::Pyramid { stage } => match map.get_mut(instrument_id) {
                Some(pos) => {
                    pos.apply_buy(price, qty, stage);
                    FillOutcome { position: Some(pos.clone()), realized_pnl: 0.0, closed: None }
                }
                None => FillOutcome { position: None, realized_pnl: 0.0, closed: None },
            },
            FillIntent::PartialExit | FillIntent::FullExit => {
                let Some(pos) = map.get_mut(instrument_id) else {
                    return FillOutcome { position: None, realized_pnl: 0.0, closed: None };
                };
                let pnl = pos.apply_sell(price, qty, intent == FillIntent::PartialExit);
                if pos.is_open() {
                    return FillOutcome { position: Some(pos.clone()), realized_pnl: pnl, closed: None };
                }
                let closed = pos.close(ts);
                map.remove(instrument_id);
                FillOutcome { position: None, realized_pnl: pnl, closed: Some(closed) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PositionConfig {
        PositionConfig::default()
    }

    fn pos() -> Position {
        // planned 100, stage 1 = 40 units
        Position::open("A", 100, 100.0, 40, 78.0, 85.0, 0)
    }

    #[test]
    fn test_stop_loss_full_exit() {
        let mut p = pos();
        assert_eq!(p.evaluate(97.0, &cfg()), PositionAction::StopLoss { qty: 40 });
        let mut p = pos();
        assert_eq!(p.evaluate(97.5, &cfg()), PositionAction::None);
    }

    #[test]
    fn test_stop_loss_precedes_trailing_stop() {
        let c = cfg();
        let mut p = pos();
        // Stage 2 at 102 lifts the average cost to ~100.86.
        assert_eq!(p.evaluate(102.01, &c), PositionAction::Pyramid { stage: 2, qty: 30 });
        p.apply_buy(102.0, 30, 2);
        assert!((p.avg_cost - 7_060.0 / 70.0).abs() < 1e-9);

        // Peak 104 arms the trailing stop at 100.88.
        assert_eq!(p.evaluate(104.0, &c), PositionAction::None);
        let stop = p.trailing_stop(&c).unwrap();

        // 97.8 is under the trailing stop and 3.03% under average cost.
        assert!(97.8 <= stop);
        assert!(p.gain_pct(97.8) <= -c.stop_loss_pct);
        assert_eq!(p.evaluate(97.8, &c), PositionAction::StopLoss { qty: 70 });
    }

    #[test]
    fn test_stage_advance_measured_from_previous_fill() {
        let c = cfg();
        let mut p = pos();
        assert_eq!(p.evaluate(101.9, &c), PositionAction::None);
        assert_eq!(p.evaluate(102.01, &c), PositionAction::Pyramid { stage: 2, qty: 30 });
        p.apply_buy(102.0, 30, 2);
        assert_eq!(p.entry_stage, 2);
        // stage 3 needs +3% over 102
        assert_eq!(p.evaluate(104.0, &c), PositionAction::None);
        assert_eq!(p.evaluate(105.1, &c), PositionAction::Pyramid { stage: 3, qty: 30 });
        p.apply_buy(105.1, 30, 3);
        assert_eq!(p.entry_stage, 3);
        assert_eq!(p.quantity, 100);
    }

    #[test]
    fn test_entry_stage_never_moves_backward() {
        let mut p = pos();
        p.apply_buy(102.0, 30, 2);
        p.apply_buy(101.0, 5, 1);
        assert_eq!(p.entry_stage, 2);
        assert_eq!(p.stage_ref_price, 102.0);
    }

    #[test]
    fn test_partial_exit_once() {
        let c = cfg();
        let mut p = pos();
        p.entry_stage = 3;
        assert_eq!(p.evaluate(105.0, &c), PositionAction::PartialExit { qty: 20 });
        p.apply_sell(105.0, 20, true);
        assert!(p.partial_exit_done);
        assert_eq!(p.exit_stage, EXIT_PARTIAL);
        assert_eq!(p.evaluate(106.0, &c), PositionAction::None);
    }

    #[test]
    fn test_no_pyramid_after_partial_exit() {
        let c = cfg();
        let mut p = pos();
        p.apply_sell(100.0, 10, true);
        assert_eq!(p.evaluate(102.5, &c), PositionAction::None);
    }

    #[test]
    fn test_trailing_stop_wide_band() {
        let c = cfg();
        let mut p = pos();
        p.partial_exit_done = true;
        p.evaluate(104.0, &c);
        // peak +4%: 3% band under 104
        let stop = p.trailing_stop(&c).unwrap();
        assert!((stop - 100.88).abs() < 1e-9);
        assert_eq!(p.evaluate(101.0, &c), PositionAction::None);
        assert!(matches!(p.evaluate(100.8, &c), PositionAction::TrailingStop { qty: 40, .. }));
    }

    #[test]
    fn test_trailing_stop_tightens_past_band() {
        let c = cfg();
        let mut p = pos();
        p.partial_exit_done = true;
        p.evaluate(112.0, &c);
        let stop = p.trailing_stop(&c).unwrap();
        assert!((stop - 109.76).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_inactive_below_activation() {
        let mut p = pos();
        p.evaluate(102.5, &cfg());
        assert!(p.trailing_stop(&cfg()).is_none());
    }

    #[test]
    fn test_highest_price_is_monotonic() {
        let c = cfg();
        let mut p = pos();
        let mut last = p.highest_price_seen;
        for price in [101.0, 99.0, 103.0, 98.5, 102.0, 104.5, 97.0] {
            p.evaluate(price, &c);
            assert!(p.highest_price_seen >= last);
            last = p.highest_price_seen;
        }
        assert_eq!(last, 104.5);
    }

    #[test]
    fn test_book_full_lifecycle_reports_closed_return() {
        let book = PositionBook::new();
        let plan = EntryPlan { planned_quantity: 100, quant_score: 78.0, ai_score: 85.0 };
        book.apply_fill("A", FillIntent::Entry, 100.0, 40, Some(plan), 10);
        assert!(book.contains("A"));
        let out = book.apply_fill("A", FillIntent::PartialExit, 110.0, 20, None, 20);
        assert!((out.realized_pnl - 200.0).abs() < 1e-9);
        assert!(out.closed.is_none());
        let out = book.apply_fill("A", FillIntent::FullExit, 90.0, 20, None, 30);
        let closed = out.closed.unwrap();
        assert!(!book.contains("A"));
        assert!((closed.realized_pnl - 0.0).abs() < 1e-9);
        assert_eq!(closed.entry_quant_score, 78.0);
        assert_eq!(closed.closed_at, 30);
    }

    #[test]
    fn test_exit_fill_for_unknown_instrument_is_ignored() {
        let book = PositionBook::new();
        let out = book.apply_fill("Z", FillIntent::FullExit, 10.0, 5, None, 0);
        assert!(out.position.is_none());
        assert!(out.closed.is_none());
    }
}
