use crate::domain::repositories::price_history::{HistoricalPriceSource, MarketDataError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Daily closes held in memory, loaded by the caller
#[derive(Default)]
pub struct InMemoryPriceHistory {
    closes: RwLock<HashMap<String, Vec<f64>>>,
}

impl InMemoryPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the series for `symbol`, oldest close first
    pub fn load(&self, symbol: &str, closes: Vec<f64>) {
        let mut map = self
            .closes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(symbol.to_string(), closes);
    }
}

#[async_trait]
impl HistoricalPriceSource for InMemoryPriceHistory {
    async fn daily_closes(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> Result<Vec<f64>, MarketDataError> {
        let map = self
            .closes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let series = map
            .get(symbol)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MarketDataError::NoData(symbol.to_string()))?;

        let keep = usize::try_from(lookback_days).unwrap_or(usize::MAX);
        let start = series.len().saturating_sub(keep);
        Ok(series[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_most_recent_window() {
        let history = InMemoryPriceHistory::new();
        history.load("AAPL", vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(history.daily_closes("AAPL", 2).await.unwrap(), vec![3.0, 4.0]);
        assert_eq!(history.daily_closes("AAPL", 365).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let history = InMemoryPriceHistory::new();
        assert_eq!(
            history.daily_closes("MSFT", 10).await.unwrap_err(),
            MarketDataError::NoData("MSFT".to_string())
        );
    }
}
