//! Pattern weight table and feedback ledger.
//!
//! Weights are kept in basis points so every step is exact: +100 on a
//! confirmed-correct observation, -200 on a confirmed-wrong one, clamped to
//! [3000, 9900]. A ledger key is `(pattern, instrument, detected_at)` and
//! resolves at most once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::PatternId;

pub const WEIGHT_MIN_BP: u32 = 3_000;
pub const WEIGHT_MAX_BP: u32 = 9_900;
pub const STEP_CORRECT_BP: u32 = 100;
pub const STEP_WRONG_BP: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Correct,
    Wrong,
}

impl Outcome {
    /// A detection was right when the price did not rise past the decision price.
    pub fn judge(price_at_decision: f64, price_after_window: f64) -> Self {
        if price_after_window <= price_at_decision {
            Outcome::Correct
        } else {
            Outcome::Wrong
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Correct => "CORRECT",
            Outcome::Wrong => "WRONG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternWeight {
    pub pattern_id: PatternId,
    pub weight_bp: u32,
    /// Incremented on every applied feedback
    pub version: u64,
    pub correct: u64,
    pub wrong: u64,
}

impl PatternWeight {
    pub fn initial(pattern_id: PatternId) -> Self {
        Self {
            pattern_id,
            weight_bp: pattern_id.initial_weight_bp(),
            version: 0,
            correct: 0,
            wrong: 0,
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight_bp as f64 / 10_000.0
    }

    pub fn apply(&mut self, outcome: Outcome) {
        self.weight_bp = match outcome {
            Outcome::Correct => {
                self.correct += 1;
                (self.weight_bp + STEP_CORRECT_BP).min(WEIGHT_MAX_BP)
            }
            Outcome::Wrong => {
                self.wrong += 1;
                self.weight_bp.saturating_sub(STEP_WRONG_BP).max(WEIGHT_MIN_BP)
            }
        };
        self.version += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedbackKey {
    pub pattern_id: PatternId,
    pub instrument_id: String,
    pub detected_at: u64,
}

impl FeedbackKey {
    pub fn storage_key(&self) -> String {
        format!("{}|{}|{}", self.pattern_id.as_str(), self.instrument_id, self.detected_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub pattern_id: PatternId,
    pub instrument_id: String,
    pub detected_at: u64,
    pub avoided_action: bool,
    pub price_at_decision: f64,
    pub price_after_window: Option<f64>,
    pub outcome: Option<Outcome>,
}

impl FeedbackRecord {
    pub fn key(&self) -> FeedbackKey {
        FeedbackKey {
            pattern_id: self.pattern_id,
            instrument_id: self.instrument_id.clone(),
            detected_at: self.detected_at,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Default)]
pub struct FeedbackLedger {
    records: HashMap<FeedbackKey, FeedbackRecord>,
}

impl FeedbackLedger {
    /// False when the key already exists.
    pub fn open(&mut self, record: FeedbackRecord) -> bool {
        let key = record.key();
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key, record);
        true
    }

    pub fn get(&self, key: &FeedbackKey) -> Option<&FeedbackRecord> {
        self.records.get(key)
    }

    /// Writes the outcome once. None for unknown or already-resolved keys.
    pub fn resolve(&mut self, key: &FeedbackKey, outcome: Outcome, price_after: f64) -> Option<FeedbackRecord> {
        let rec = self.records.get_mut(key)?;
        if rec.is_resolved() {
            return None;
        }
        rec.outcome = Some(outcome);
        rec.price_after_window = Some(price_after);
        Some(rec.clone())
    }

    /// Pending records whose observation window has elapsed, oldest first.
    pub fn due(&self, now: u64, window_secs: u64) -> Vec<FeedbackRecord> {
        let mut due: Vec<FeedbackRecord> = self
            .records
            .values()
            .filter(|r| !r.is_resolved() && r.detected_at.saturating_add(window_secs) <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then_with(|| a.key().cmp(&b.key())));
        due
    }

    pub fn pending_len(&self) -> usize {
        self.records.values().filter(|r| !r.is_resolved()).count()
    }

    /// Drop resolved records detected before `older_than`.
    pub fn prune_resolved(&mut self, older_than: u64) {
        self.records.retain(|_, r| !r.is_resolved() || r.detected_at >= older_than);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(detected_at: u64) -> FeedbackRecord {
        FeedbackRecord {
            pattern_id: PatternId::FxShock,
            instrument_id: "A".into(),
            detected_at,
            avoided_action: true,
            price_at_decision: 100.0,
            price_after_window: None,
            outcome: None,
        }
    }

    #[test]
    fn test_weight_steps_are_exact() {
        let mut w = PatternWeight { weight_bp: 5_000, ..PatternWeight::initial(PatternId::FxShock) };
        w.apply(Outcome::Correct);
        assert_eq!(w.weight_bp, 5_100);
        w.apply(Outcome::Wrong);
        assert_eq!(w.weight_bp, 4_900);
        assert_eq!(w.version, 2);
        assert!((w.weight() - 0.49).abs() < 1e-12);
    }

    #[test]
    fn test_weight_clamps() {
        let mut w = PatternWeight { weight_bp: 9_850, ..PatternWeight::initial(PatternId::FxShock) };
        w.apply(Outcome::Correct);
        assert_eq!(w.weight_bp, WEIGHT_MAX_BP);
        let mut w = PatternWeight { weight_bp: 3_100, ..PatternWeight::initial(PatternId::FxShock) };
        w.apply(Outcome::Wrong);
        assert_eq!(w.weight_bp, WEIGHT_MIN_BP);
    }

    #[test]
    fn test_outcome_judgement() {
        assert_eq!(Outcome::judge(100.0, 95.0), Outcome::Correct);
        assert_eq!(Outcome::judge(100.0, 100.0), Outcome::Correct);
        assert_eq!(Outcome::judge(100.0, 101.0), Outcome::Wrong);
    }

    #[test]
    fn test_ledger_resolves_once() {
        let mut ledger = FeedbackLedger::default();
        assert!(ledger.open(record(10)));
        assert!(!ledger.open(record(10)));
        let key = record(10).key();
        assert!(ledger.resolve(&key, Outcome::Correct, 90.0).is_some());
        assert!(ledger.resolve(&key, Outcome::Wrong, 110.0).is_none());
        assert_eq!(ledger.get(&key).unwrap().outcome, Some(Outcome::Correct));
    }

    #[test]
    fn test_ledger_due_respects_window() {
        let mut ledger = FeedbackLedger::default();
        ledger.open(record(100));
        ledger.open(record(500));
        let due = ledger.due(1_200, 1_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].detected_at, 100);
        assert_eq!(ledger.pending_len(), 2);
    }

    #[test]
    fn test_prune_keeps_pending() {
        let mut ledger = FeedbackLedger::default();
        ledger.open(record(1));
        ledger.open(record(2));
        ledger.resolve(&record(1).key(), Outcome::Wrong, 120.0);
        ledger.prune_resolved(100);
        assert!(ledger.get(&record(1).key()).is_none());
        assert!(ledger.get(&record(2).key()).is_some());
    }
}
