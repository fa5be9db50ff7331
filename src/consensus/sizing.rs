//! Position sizing for approved candidates.
//!
//! All functions return whole units of the instrument.

/// Allocation multiplier by consensus score
pub fn score_multiplier(final_score: f64) -> f64 {
    if final_score >= 85.0 {
        1.5
    } else if final_score >= 75.0 {
        1.2
    } else {
        1.0
    }
}

/// Higher volatility than the reference shrinks the allocation; lower never grows it
pub fn volatility_divisor(volatility_pct: f64, base_volatility_pct: f64) -> f64 {
    if base_volatility_pct <= 0.0 || !volatility_pct.is_finite() {
        return 1.0;
    }
    (volatility_pct.abs() / base_volatility_pct).max(1.0)
}

/// Fixed notional value per trade
pub fn fixed_notional(notional: f64, price: f64) -> u64 {
    if price <= 0.0 || notional <= 0.0 {
        return 0;
    }
    (notional / price).floor() as u64
}

pub fn recommended_quantity(
    base_allocation: f64,
    final_score: f64,
    volatility_pct: f64,
    base_volatility_pct: f64,
    price: f64,
) -> u64 {
    let notional = base_allocation * score_multiplier(final_score)
        / volatility_divisor(volatility_pct, base_volatility_pct);
    fixed_notional(notional, price)
}

/// Quantity for one entry tranche of a planned total
pub fn tranche(planned: u64, fraction: f64) -> u64 {
    ((planned as f64) * fraction.clamp(0.0, 1.0)).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_multiplier_bands() {
        assert_eq!(score_multiplier(90.0), 1.5);
        assert_eq!(score_multiplier(85.0), 1.5);
        assert_eq!(score_multiplier(80.0), 1.2);
        assert_eq!(score_multiplier(65.0), 1.0);
    }

    #[test]
    fn test_volatility_divisor_never_below_one() {
        assert_eq!(volatility_divisor(1.0, 2.0), 1.0);
        assert_eq!(volatility_divisor(4.0, 2.0), 2.0);
        assert_eq!(volatility_divisor(4.0, 0.0), 1.0);
    }

    #[test]
    fn test_recommended_quantity() {
        // 1_000_000 * 1.2 / 2 / 10_000 = 60
        assert_eq!(recommended_quantity(1_000_000.0, 80.0, 4.0, 2.0, 10_000.0), 60);
        assert_eq!(recommended_quantity(1_000_000.0, 80.0, 4.0, 2.0, 0.0), 0);
    }

    #[test]
    fn test_tranche_floors() {
        assert_eq!(tranche(10, 0.4), 4);
        assert_eq!(tranche(7, 0.3), 2);
        assert_eq!(tranche(7, 1.5), 7);
    }
}
