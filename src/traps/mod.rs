//! Trap detector: adversarial market patterns that suppress or veto entries.
//!
//! Detection is read-only over a snapshot. The only mutator of a pattern's
//! weight is [`TrapDetector::record_feedback`], which is idempotent per
//! `(pattern, instrument, detected_at)`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::config::TrapConfig;
use crate::logging::{log, log_trap, log_weight_change, obj, v_str, Domain, Level};
use crate::market::MarketSnapshot;

pub mod calendar;
pub mod learning;
pub mod patterns;

pub use calendar::ReferenceCalendar;
pub use learning::{FeedbackKey, FeedbackLedger, FeedbackRecord, Outcome, PatternWeight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternId {
    GapOverextension,
    FlowDivergenceOnRise,
    ProgramFlowAcceleration,
    PostNewsReversal,
    VolumeLessRally,
    ResistanceWall,
    SectorDecoupling,
    FxShock,
    LongMaResistance,
    DilutionEventDay,
}

impl PatternId {
    pub const ALL: [PatternId; 10] = [
        PatternId::GapOverextension,
        PatternId::FlowDivergenceOnRise,
        PatternId::ProgramFlowAcceleration,
        PatternId::PostNewsReversal,
        PatternId::VolumeLessRally,
        PatternId::ResistanceWall,
        PatternId::SectorDecoupling,
        PatternId::FxShock,
        PatternId::LongMaResistance,
        PatternId::DilutionEventDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternId::GapOverextension => "gap_overextension",
            PatternId::FlowDivergenceOnRise => "flow_divergence_on_rise",
            PatternId::ProgramFlowAcceleration => "program_flow_acceleration",
            PatternId::PostNewsReversal => "post_news_reversal",
            PatternId::VolumeLessRally => "volume_less_rally",
            PatternId::ResistanceWall => "resistance_wall",
            PatternId::SectorDecoupling => "sector_decoupling",
            PatternId::FxShock => "fx_shock",
            PatternId::LongMaResistance => "long_ma_resistance",
            PatternId::DilutionEventDay => "dilution_event_day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    pub fn severity(&self) -> Severity {
        match self {
            PatternId::FlowDivergenceOnRise => Severity::Critical,
            PatternId::GapOverextension
            | PatternId::ProgramFlowAcceleration
            | PatternId::FxShock
            | PatternId::DilutionEventDay => Severity::High,
            PatternId::PostNewsReversal
            | PatternId::VolumeLessRally
            | PatternId::ResistanceWall
            | PatternId::SectorDecoupling => Severity::Medium,
            PatternId::LongMaResistance => Severity::Low,
        }
    }

    /// Starting weight before any feedback, in basis points.
    pub fn initial_weight_bp(&self) -> u32 {
        match self.severity() {
            Severity::Critical => 9_000,
            Severity::High => 8_000,
            Severity::Medium => 7_000,
            Severity::Low => 6_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrapDetection {
    pub pattern_id: PatternId,
    pub severity: Severity,
    /// The pattern's weight at detection time
    pub confidence: f64,
    pub weight: f64,
    pub evidence: String,
}

/// Result of an applied feedback observation.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightUpdate {
    pub record: FeedbackRecord,
    pub weight: PatternWeight,
    pub before_bp: u32,
}

pub struct TrapDetector {
    cfg: TrapConfig,
    calendar: RwLock<ReferenceCalendar>,
    weights: Mutex<HashMap<PatternId, PatternWeight>>,
    ledger: Mutex<FeedbackLedger>,
}

impl TrapDetector {
    pub fn new(cfg: TrapConfig, calendar: ReferenceCalendar) -> Self {
        let weights = PatternId::ALL
            .into_iter()
            .map(|p| (p, PatternWeight::initial(p)))
            .collect();
        Self {
            cfg,
            calendar: RwLock::new(calendar),
            weights: Mutex::new(weights),
            ledger: Mutex::new(FeedbackLedger::default()),
        }
    }

    pub fn config(&self) -> &TrapConfig {
        &self.cfg
    }

    /// Load persisted weights and open feedback records.
    pub fn restore(&self, weights: Vec<PatternWeight>, feedback: Vec<FeedbackRecord>) {
        let mut table = self.weights.lock().unwrap_or_else(|e| e.into_inner());
        for w in weights {
            let mut w = w;
            w.weight_bp = w.weight_bp.clamp(learning::WEIGHT_MIN_BP, learning::WEIGHT_MAX_BP);
            table.insert(w.pattern_id, w);
        }
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        for rec in feedback {
            ledger.open(rec);
        }
    }

    pub fn update_calendar(&self, calendar: ReferenceCalendar) {
        *self.calendar.write().unwrap_or_else(|e| e.into_inner()) = calendar;
    }

    pub fn weight(&self, pattern: PatternId) -> PatternWeight {
        self.weights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pattern)
            .cloned()
            .unwrap_or_else(|| PatternWeight::initial(pattern))
    }

    pub fn weights(&self) -> Vec<PatternWeight> {
        let table = self.weights.lock().unwrap_or_else(|e| e.into_inner());
        PatternId::ALL.iter().filter_map(|p| table.get(p).cloned()).collect()
    }

    /// Every firing pattern, highest severity first (then highest confidence).
    pub fn detect(&self, snap: &MarketSnapshot) -> Vec<TrapDetection> {
        let calendar = self.calendar.read().unwrap_or_else(|e| e.into_inner());
        let weights = self.weights.lock().unwrap_or_else(|e| e.into_inner());

        let mut found: Vec<TrapDetection> = PatternId::ALL
            .into_iter()
            .filter_map(|p| {
                let evidence = patterns::evaluate(p, snap, &self.cfg, &calendar)?;
                let weight = weights.get(&p).map(|w| w.weight()).unwrap_or(0.0);
                Some(TrapDetection {
                    pattern_id: p,
                    severity: p.severity(),
                    confidence: weight,
                    weight,
                    evidence,
                })
            })
            .collect();
        drop(weights);

        found.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        for d in &found {
            log_trap(&snap.instrument_id, d.pattern_id.as_str(), d.severity.as_str(), d.confidence, &d.evidence);
        }
        found
    }

    /// Open a pending feedback record for a detection that gated a decision.
    pub fn open_feedback(
        &self,
        detection: &TrapDetection,
        snap: &MarketSnapshot,
        avoided_action: bool,
    ) -> Option<FeedbackRecord> {
        let record = FeedbackRecord {
            pattern_id: detection.pattern_id,
            instrument_id: snap.instrument_id.clone(),
            detected_at: snap.ts,
            avoided_action,
            price_at_decision: snap.price,
            price_after_window: None,
            outcome: None,
        };
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.open(record.clone()).then_some(record)
    }

    pub fn due_feedback(&self, now: u64) -> Vec<FeedbackRecord> {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .due(now, self.cfg.feedback_window_secs)
    }

    pub fn pending_feedback(&self) -> usize {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).pending_len()
    }

    /// Apply one observed outcome. None if the key is unknown or was
    /// already resolved, so a replayed observation never moves a weight twice.
    pub fn record_feedback(&self, key: &FeedbackKey, outcome: Outcome, price_after: f64) -> Option<WeightUpdate> {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = ledger.resolve(key, outcome, price_after) else {
            log(
                Level::Debug,
                Domain::Trap,
                "feedback_ignored",
                obj(&[
                    ("pattern_id", v_str(key.pattern_id.as_str())),
                    ("instrument_id", v_str(&key.instrument_id)),
                    ("reason", v_str("unknown or already resolved")),
                ]),
            );
            return None;
        };

        let mut weights = self.weights.lock().unwrap_or_else(|e| e.into_inner());
        let entry = weights
            .entry(key.pattern_id)
            .or_insert_with(|| PatternWeight::initial(key.pattern_id));
        let before_bp = entry.weight_bp;
        entry.apply(outcome);
        let weight = entry.clone();
        drop(weights);
        drop(ledger);

        log_weight_change(
            key.pattern_id.as_str(),
            outcome.as_str(),
            before_bp as f64 / 10_000.0,
            weight.weight(),
            weight.version,
        );
        Some(WeightUpdate { record, weight, before_bp })
    }

    pub fn prune_resolved(&self, older_than: u64) {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .prune_resolved(older_than);
    }
}
