//! Scenario enumeration: best / expected / worst outcomes at fixed odds.

pub const P_BEST: f64 = 0.2;
pub const P_EXPECTED: f64 = 0.6;
pub const P_WORST: f64 = 0.2;
pub const BEST_MULT: f64 = 1.5;
pub const EXPECTED_MULT: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioEstimate {
    pub best_pct: f64,
    pub expected_pct: f64,
    pub worst_pct: f64,
    /// Probability-weighted return, percent
    pub expectation_pct: f64,
    pub score: f64,
    pub target_price: f64,
}

/// Maps a percent return onto a 0–100 score, 0% → 50, ±5% → 100/0.
pub fn return_score(pct: f64) -> f64 {
    (50.0 + 10.0 * pct).clamp(0.0, 100.0)
}

pub fn estimate(predicted_return_pct: f64, stop_floor_pct: f64, price: f64) -> ScenarioEstimate {
    let best_pct = predicted_return_pct * BEST_MULT;
    let expected_pct = predicted_return_pct * EXPECTED_MULT;
    let worst_pct = -stop_floor_pct.abs();
    let expectation_pct = P_BEST * best_pct + P_EXPECTED * expected_pct + P_WORST * worst_pct;
    ScenarioEstimate {
        best_pct,
        expected_pct,
        worst_pct,
        expectation_pct,
        score: return_score(expectation_pct),
        target_price: price * (1.0 + expected_pct / 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probabilities_sum_to_one() {
        assert!((P_BEST + P_EXPECTED + P_WORST - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_expectation_for_five_percent_call() {
        let e = estimate(5.0, 3.0, 10_000.0);
        assert!((e.best_pct - 7.5).abs() < 1e-9);
        assert!((e.expected_pct - 4.0).abs() < 1e-9);
        assert_eq!(e.worst_pct, -3.0);
        assert!((e.expectation_pct - 3.3).abs() < 1e-9);
        assert!((e.score - 83.0).abs() < 1e-9);
        assert!((e.target_price - 10_400.0).abs() < 1e-6);
    }

    #[test]
    fn test_negative_call_scores_low() {
        let e = estimate(-4.0, 3.0, 100.0);
        assert!(e.score < 20.0);
        assert!(e.target_price < 100.0);
    }
}
