/// Trading days used to annualize daily volatility
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Estimates annualized volatility from a daily close series
pub trait VolatilityEstimator: Send + Sync {
    /// Returns `None` when the series is too short or degenerate
    fn annualized(&self, closes: &[f64]) -> Option<f64>;
}

/// Sample standard deviation of daily percent returns, scaled by sqrt(252)
#[derive(Debug, Clone, Copy)]
pub struct HistoricalVolatility {
    /// Closes needed before an estimate is produced (at least 3 for two returns)
    pub min_closes: usize,
}

impl Default for HistoricalVolatility {
    fn default() -> Self {
        HistoricalVolatility { min_closes: 3 }
    }
}

impl VolatilityEstimator for HistoricalVolatility {
    fn annualized(&self, closes: &[f64]) -> Option<f64> {
        if closes.len() < self.min_closes.max(3) {
            return None;
        }
        if closes.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return None;
        }

        let returns: Vec<f64> = closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);

        Some(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_series_has_zero_volatility() {
        let vol = HistoricalVolatility::default().annualized(&[100.0, 100.0, 100.0, 100.0]);
        assert_eq!(vol, Some(0.0));
    }

    #[test]
    fn test_too_short_series() {
        let est = HistoricalVolatility::default();
        assert_eq!(est.annualized(&[]), None);
        assert_eq!(est.annualized(&[100.0, 101.0]), None);
    }

    #[test]
    fn test_invalid_prices_are_rejected() {
        let est = HistoricalVolatility::default();
        assert_eq!(est.annualized(&[100.0, 0.0, 101.0]), None);
        assert_eq!(est.annualized(&[100.0, f64::NAN, 101.0]), None);
    }

    #[test]
    fn test_known_series() {
        // returns: +10%, -10%; mean 0; sample variance 0.02
        let vol = HistoricalVolatility::default()
            .annualized(&[100.0, 110.0, 99.0])
            .unwrap();
        let expected = 0.02_f64.sqrt() * 252.0_f64.sqrt();
        assert!((vol - expected).abs() < 1e-12);
    }

    #[test]
    fn test_higher_swings_mean_higher_volatility() {
        let est = HistoricalVolatility::default();
        let calm = est.annualized(&[100.0, 100.5, 100.0, 100.5, 100.0]).unwrap();
        let wild = est.annualized(&[100.0, 110.0, 95.0, 112.0, 90.0]).unwrap();
        assert!(wild > calm);
    }
}
