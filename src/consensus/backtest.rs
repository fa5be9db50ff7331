//! Historical-analogue estimate over realized returns of similar setups.

use super::scenario::return_score;

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestEstimate {
    pub samples: usize,
    /// Fraction of similar setups that closed with a gain
    pub win_rate: f64,
    pub mean_return_pct: f64,
    pub median_return_pct: f64,
    pub score: f64,
    pub target_price: f64,
}

/// Fewer than `min_samples` outcomes reports a zero win rate and score.
pub fn estimate(returns_pct: &[f64], min_samples: usize, price: f64) -> BacktestEstimate {
    let usable: Vec<f64> = returns_pct.iter().copied().filter(|r| r.is_finite()).collect();
    if usable.is_empty() || usable.len() < min_samples {
        return BacktestEstimate {
            samples: usable.len(),
            win_rate: 0.0,
            mean_return_pct: 0.0,
            median_return_pct: 0.0,
            score: 0.0,
            target_price: price,
        };
    }
    let n = usable.len() as f64;
    let wins = usable.iter().filter(|r| **r > 0.0).count() as f64;
    let win_rate = wins / n;
    let mean = usable.iter().sum::<f64>() / n;

    let mut sorted = usable.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    BacktestEstimate {
        samples: usable.len(),
        win_rate,
        mean_return_pct: mean,
        median_return_pct: median,
        score: 0.6 * win_rate * 100.0 + 0.4 * return_score(mean),
        target_price: price * (1.0 + median / 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_rate_and_mean() {
        let e = estimate(&[2.0, -1.0, 3.0, 4.0, -2.0], 5, 100.0);
        assert_eq!(e.samples, 5);
        assert!((e.win_rate - 0.6).abs() < 1e-12);
        assert!((e.mean_return_pct - 1.2).abs() < 1e-12);
        assert_eq!(e.median_return_pct, 2.0);
        // 0.6 * 60 + 0.4 * 62
        assert!((e.score - 60.8).abs() < 1e-9);
        assert!((e.target_price - 102.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_history() {
        let e = estimate(&[5.0, 5.0], 5, 100.0);
        assert_eq!(e.win_rate, 0.0);
        assert_eq!(e.score, 0.0);
        assert_eq!(e.target_price, 100.0);
    }

    #[test]
    fn test_even_sample_median() {
        let e = estimate(&[1.0, 2.0, 3.0, 10.0], 1, 100.0);
        assert_eq!(e.median_return_pct, 2.5);
    }
}
