//! Historical market data consumed by the volatility estimator.
//!
//! Implementations are best-effort: a failure degrades the volatility fields
//! of a position, never the reconciliation itself.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarketDataError {
    #[error("No price history for {0}")]
    NoData(String),

    #[error("Market data unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait HistoricalPriceSource: Send + Sync {
    /// Daily closing prices, oldest first, covering at most `lookback_days`
    async fn daily_closes(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> Result<Vec<f64>, MarketDataError>;
}
