//! Consensus validator: re-scores a fused candidate three independent ways
//! (scenario enumeration, historical analogues, stochastic simulation) and
//! approves only when the blended score and both statistical floors pass.
//!
//! Rejection is the common outcome and is not an error.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::collab::{HistoryProvider, SetupQuery};
use crate::config::ConsensusConfig;
use crate::logging::log_validation;

pub mod backtest;
pub mod montecarlo;
pub mod scenario;
pub mod sizing;

pub const W_SCENARIO: f64 = 0.3;
pub const W_BACKTEST: f64 = 0.4;
pub const W_MONTECARLO: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub candidate_id: String,
    pub instrument_id: String,
    pub quant_score: f64,
    pub ai_score: f64,
    pub fused_score: f64,
    /// Recent daily volatility, percent
    pub volatility_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub candidate_id: String,
    pub scenario_score: f64,
    pub backtest_score: f64,
    pub montecarlo_score: f64,
    pub final_score: f64,
    pub scenario_target: f64,
    pub backtest_target: f64,
    pub montecarlo_target: f64,
    /// Most conservative of the three targets
    pub adjusted_target_price: f64,
    pub backtest_win_rate: f64,
    pub backtest_samples: usize,
    pub montecarlo_profit_probability: f64,
    pub recommended_size: u64,
    pub approved: bool,
    pub reason: String,
}

pub fn final_score(scenario: f64, backtest: f64, montecarlo: f64) -> f64 {
    scenario * W_SCENARIO + backtest * W_BACKTEST + montecarlo * W_MONTECARLO
}

/// Every clause must pass; the reason lists each failing clause.
pub fn approval_verdict(
    final_score: f64,
    win_rate: f64,
    profit_probability: f64,
    cfg: &ConsensusConfig,
) -> (bool, String) {
    let mut failures = Vec::new();
    if final_score < cfg.min_final_score {
        failures.push(format!("final score {:.1} < {:.1}", final_score, cfg.min_final_score));
    }
    if win_rate < cfg.min_win_rate {
        failures.push(format!(
            "backtest win rate {:.1}% < {:.1}%",
            win_rate * 100.0,
            cfg.min_win_rate * 100.0
        ));
    }
    if profit_probability < cfg.min_profit_probability {
        failures.push(format!(
            "profit probability {:.1}% < {:.1}%",
            profit_probability * 100.0,
            cfg.min_profit_probability * 100.0
        ));
    }
    if failures.is_empty() {
        (true, "all consensus clauses passed".to_string())
    } else {
        (false, failures.join("; "))
    }
}

pub struct ConsensusValidator {
    cfg: ConsensusConfig,
    history: Arc<dyn HistoryProvider>,
}

impl ConsensusValidator {
    pub fn new(cfg: ConsensusConfig, history: Arc<dyn HistoryProvider>) -> Self {
        Self { cfg, history }
    }

    fn rng(&self) -> StdRng {
        match self.cfg.mc_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub async fn validate(
        &self,
        candidate: &Candidate,
        current_price: f64,
        ai_predicted_return: f64,
    ) -> Result<ValidationResult> {
        let scenario = scenario::estimate(ai_predicted_return, self.cfg.stop_floor_pct, current_price);

        let history = self
            .history
            .similar_setups(&SetupQuery {
                instrument_id: candidate.instrument_id.clone(),
                quant_score: candidate.quant_score,
                ai_score: candidate.ai_score,
                band: self.cfg.similar_band,
            })
            .await?;
        let backtest = backtest::estimate(&history, self.cfg.min_history, current_price);

        let simulation = montecarlo::simulate(
            ai_predicted_return,
            self.cfg.mc_conservative_fraction,
            candidate.volatility_pct,
            self.cfg.mc_samples,
            current_price,
            &mut self.rng(),
        );

        let final_score = final_score(scenario.score, backtest.score, simulation.score);
        let adjusted_target_price = scenario
            .target_price
            .min(backtest.target_price)
            .min(simulation.target_price);
        let (approved, mut reason) = approval_verdict(
            final_score,
            backtest.win_rate,
            simulation.profit_probability,
            &self.cfg,
        );
        if backtest.samples < self.cfg.min_history {
            reason = format!(
                "{}; only {} similar setups (need {})",
                reason, backtest.samples, self.cfg.min_history
            );
        }
        let recommended_size = if approved {
            sizing::recommended_quantity(
                self.cfg.base_allocation,
                final_score,
                candidate.volatility_pct,
                self.cfg.base_volatility_pct,
                current_price,
            )
        } else {
            0
        };

        log_validation(
            &candidate.instrument_id,
            [scenario.score, backtest.score, simulation.score],
            final_score,
            approved,
            &reason,
        );

        Ok(ValidationResult {
            candidate_id: candidate.candidate_id.clone(),
            scenario_score: scenario.score,
            backtest_score: backtest.score,
            montecarlo_score: simulation.score,
            final_score,
            scenario_target: scenario.target_price,
            backtest_target: backtest.target_price,
            montecarlo_target: simulation.target_price,
            adjusted_target_price,
            backtest_win_rate: backtest.win_rate,
            backtest_samples: backtest.samples,
            montecarlo_profit_probability: simulation.profit_probability,
            recommended_size,
            approved,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedHistory(Vec<f64>);

    #[async_trait]
    impl HistoryProvider for FixedHistory {
        async fn similar_setups(&self, _query: &SetupQuery) -> Result<Vec<f64>> {
            Ok(self.0.clone())
        }
    }

    /// `wins` of 100 setups at +3%, the rest at -1%.
    fn history_with_win_rate(wins: usize) -> Vec<f64> {
        (0..100).map(|i| if i < wins { 3.0 } else { -1.0 }).collect()
    }

    fn validator(history: Vec<f64>) -> ConsensusValidator {
        let cfg = ConsensusConfig { mc_seed: Some(42), ..Default::default() };
        ConsensusValidator::new(cfg, Arc::new(FixedHistory(history)))
    }

    fn candidate() -> Candidate {
        Candidate {
            candidate_id: "c-1".into(),
            instrument_id: "A".into(),
            quant_score: 78.0,
            ai_score: 85.0,
            fused_score: 81.5,
            volatility_pct: 2.0,
        }
    }

    #[test]
    fn test_final_score_weights() {
        assert!((final_score(100.0, 0.0, 0.0) - 30.0).abs() < 1e-12);
        assert!((final_score(0.0, 100.0, 0.0) - 40.0).abs() < 1e-12);
        assert!((final_score(0.0, 0.0, 100.0) - 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_each_clause_flips_approval() {
        let cfg = ConsensusConfig::default();
        assert!(approval_verdict(70.0, 0.60, 0.70, &cfg).0);
        assert!(!approval_verdict(64.9, 0.60, 0.70, &cfg).0);
        assert!(!approval_verdict(70.0, 0.54, 0.70, &cfg).0);
        assert!(!approval_verdict(70.0, 0.60, 0.59, &cfg).0);
    }

    #[test]
    fn test_rejection_reason_lists_all_failures() {
        let cfg = ConsensusConfig::default();
        let (ok, reason) = approval_verdict(10.0, 0.1, 0.1, &cfg);
        assert!(!ok);
        assert_eq!(reason.split("; ").count(), 3);
    }

    #[tokio::test]
    async fn test_approves_strong_candidate() {
        let v = validator(history_with_win_rate(70));
        let r = v.validate(&candidate(), 10_000.0, 5.0).await.unwrap();
        assert!(r.approved, "{}", r.reason);
        assert!(r.recommended_size > 0);
        assert!(r.final_score >= 65.0);
    }

    #[tokio::test]
    async fn test_rejects_on_backtest_win_rate_below_cutoff() {
        let v = validator(history_with_win_rate(52));
        let r = v.validate(&candidate(), 10_000.0, 5.0).await.unwrap();
        assert!(!r.approved);
        assert!((r.backtest_win_rate - 0.52).abs() < 1e-12);
        assert!(r.reason.contains("win rate"));
        assert_eq!(r.recommended_size, 0);
    }

    #[tokio::test]
    async fn test_rejects_without_history() {
        let v = validator(Vec::new());
        let r = v.validate(&candidate(), 10_000.0, 5.0).await.unwrap();
        assert!(!r.approved);
        assert!(r.reason.contains("similar setups"));
    }

    #[tokio::test]
    async fn test_adjusted_target_is_most_conservative() {
        let v = validator(history_with_win_rate(70));
        for predicted in [-3.0, 0.5, 2.0, 5.0, 12.0] {
            let r = v.validate(&candidate(), 10_000.0, predicted).await.unwrap();
            assert!(r.adjusted_target_price <= r.scenario_target);
            assert!(r.adjusted_target_price <= r.backtest_target);
            assert!(r.adjusted_target_price <= r.montecarlo_target);
        }
    }
}
