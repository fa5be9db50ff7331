//! Signal fusion: quant score and AI score into one confidence value.
//!
//! Pure over its inputs and the configured weights; holds no state, so any
//! number of candidates can be fused concurrently.

use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::traps::{Severity, TrapDetection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Buy,
    Hold,
    Sell,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Buy => "BUY",
            Recommendation::Hold => "HOLD",
            Recommendation::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionReason {
    Scored,
    /// Quant and AI disagree by more than the divergence threshold
    Divergent,
    /// No AI score (timeout, error, or unavailable)
    NoAiScore,
    /// A CRITICAL trap forced the score to zero
    TrapVeto,
}

impl FusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionReason::Scored => "scored",
            FusionReason::Divergent => "divergent",
            FusionReason::NoAiScore => "no_ai_score",
            FusionReason::TrapVeto => "trap_veto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    pub quant_score: f64,
    pub ai_score: Option<f64>,
    /// AI score after trap penalty, when one applied
    pub adjusted_ai_score: Option<f64>,
    pub fused_score: f64,
    pub recommendation: Recommendation,
    pub reason: FusionReason,
}

#[derive(Debug, Clone)]
pub struct FusionEngine {
    cfg: FusionConfig,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig) -> Self {
        Self { cfg }
    }

    fn classify(&self, fused: f64) -> Recommendation {
        if fused >= self.cfg.buy_threshold {
            Recommendation::Buy
        } else if fused <= self.cfg.sell_threshold {
            Recommendation::Sell
        } else {
            Recommendation::Hold
        }
    }

    pub fn fuse(&self, quant_score: f64, ai_score: Option<f64>) -> FusionResult {
        let quant = quant_score.clamp(0.0, 100.0);
        let Some(ai) = ai_score.map(|a| a.clamp(0.0, 100.0)) else {
            return FusionResult {
                quant_score: quant,
                ai_score: None,
                adjusted_ai_score: None,
                fused_score: quant,
                recommendation: Recommendation::Hold,
                reason: FusionReason::NoAiScore,
            };
        };

        let fused = quant * self.cfg.w_quant + ai * self.cfg.w_ai;
        let (recommendation, reason) = if (quant - ai).abs() > self.cfg.divergence_threshold {
            (Recommendation::Hold, FusionReason::Divergent)
        } else {
            (self.classify(fused), FusionReason::Scored)
        };
        FusionResult {
            quant_score: quant,
            ai_score: Some(ai),
            adjusted_ai_score: None,
            fused_score: fused,
            recommendation,
            reason,
        }
    }

    /// Fuse after trap gating. Only the highest-severity detection gates:
    /// CRITICAL zeroes the score; anything else subtracts
    /// `confidence × penalty_unit` from the AI score before fusion.
    pub fn fuse_with_traps(
        &self,
        quant_score: f64,
        ai_score: Option<f64>,
        detections: &[TrapDetection],
    ) -> FusionResult {
        let top = detections.iter().max_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| a.confidence.total_cmp(&b.confidence))
        });
        match top {
            Some(d) if d.severity == Severity::Critical => FusionResult {
                quant_score: quant_score.clamp(0.0, 100.0),
                ai_score: ai_score.map(|a| a.clamp(0.0, 100.0)),
                adjusted_ai_score: Some(0.0),
                fused_score: 0.0,
                recommendation: Recommendation::Hold,
                reason: FusionReason::TrapVeto,
            },
            Some(d) => {
                let adjusted = ai_score.map(|a| (a.clamp(0.0, 100.0) - d.confidence * self.cfg.penalty_unit).max(0.0));
                let mut result = self.fuse(quant_score, adjusted);
                result.ai_score = ai_score.map(|a| a.clamp(0.0, 100.0));
                result.adjusted_ai_score = adjusted;
                result
            }
            None => self.fuse(quant_score, ai_score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traps::PatternId;

    fn engine() -> FusionEngine {
        FusionEngine::new(FusionConfig::default())
    }

    fn detection(pattern_id: PatternId, confidence: f64) -> TrapDetection {
        TrapDetection {
            pattern_id,
            severity: pattern_id.severity(),
            confidence,
            weight: confidence,
            evidence: String::new(),
        }
    }

    #[test]
    fn test_documented_example_is_buy() {
        let r = engine().fuse(78.0, Some(85.0));
        assert!((r.fused_score - 81.5).abs() < 1e-9);
        assert_eq!(r.recommendation, Recommendation::Buy);
    }

    #[test]
    fn test_fuse_is_pure() {
        let e = engine();
        for (q, a) in [(10.0, 20.0), (50.0, 90.0), (99.0, 70.0)] {
            assert_eq!(e.fuse(q, Some(a)), e.fuse(q, Some(a)));
        }
    }

    #[test]
    fn test_divergence_forces_hold() {
        let r = engine().fuse(95.0, Some(60.0));
        assert!(r.fused_score >= 70.0);
        assert_eq!(r.recommendation, Recommendation::Hold);
        assert_eq!(r.reason, FusionReason::Divergent);

        let r = engine().fuse(5.0, Some(40.0));
        assert_eq!(r.recommendation, Recommendation::Hold);
    }

    #[test]
    fn test_divergence_exactly_at_threshold_is_not_forced() {
        let r = engine().fuse(90.0, Some(60.0));
        assert_eq!(r.reason, FusionReason::Scored);
        assert_eq!(r.recommendation, Recommendation::Buy);
    }

    #[test]
    fn test_low_scores_sell() {
        let r = engine().fuse(20.0, Some(25.0));
        assert_eq!(r.recommendation, Recommendation::Sell);
    }

    #[test]
    fn test_missing_ai_degrades_to_hold() {
        let r = engine().fuse(95.0, None);
        assert_eq!(r.recommendation, Recommendation::Hold);
        assert_eq!(r.reason, FusionReason::NoAiScore);
    }

    #[test]
    fn test_critical_trap_zeroes_score() {
        let e = engine();
        for (q, a) in [(100.0, 100.0), (78.0, 85.0), (0.0, 0.0)] {
            let r = e.fuse_with_traps(q, Some(a), &[detection(PatternId::FlowDivergenceOnRise, 0.3)]);
            assert_eq!(r.fused_score, 0.0);
            assert_eq!(r.recommendation, Recommendation::Hold);
            assert_eq!(r.reason, FusionReason::TrapVeto);
        }
    }

    #[test]
    fn test_non_critical_penalty_applies_to_ai_score() {
        let r = engine().fuse_with_traps(78.0, Some(85.0), &[detection(PatternId::ResistanceWall, 0.5)]);
        // 85 - 0.5 * 20 = 75; (78 + 75) / 2 = 76.5
        assert_eq!(r.adjusted_ai_score, Some(75.0));
        assert!((r.fused_score - 76.5).abs() < 1e-9);
        assert_eq!(r.recommendation, Recommendation::Buy);
    }

    #[test]
    fn test_only_top_detection_gates() {
        let dets = [
            detection(PatternId::LongMaResistance, 0.9),
            detection(PatternId::GapOverextension, 0.5),
        ];
        let r = engine().fuse_with_traps(80.0, Some(80.0), &dets);
        assert_eq!(r.adjusted_ai_score, Some(70.0));
    }
}
