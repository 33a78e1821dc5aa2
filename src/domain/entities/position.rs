use crate::domain::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quantities closer than this are treated as equal
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Current holding of one symbol under one (broker, strategy) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Ledger row id; 0 until the position has been stored
    pub id: i64,
    pub broker: String,
    pub strategy: String,
    pub symbol: String,
    pub quantity: f64,
    pub latest_price: f64,
    pub last_updated: DateTime<Utc>,
    pub underlying_symbol: Option<String>,
    pub underlying_latest_price: Option<f64>,
    pub underlying_volatility: Option<f64>,
}

impl Position {
    pub fn new(broker: &str, strategy: &str, symbol: &str, now: DateTime<Utc>) -> Self {
        Position {
            id: 0,
            broker: broker.to_string(),
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            quantity: 0.0,
            latest_price: 0.0,
            last_updated: now,
            underlying_symbol: None,
            underlying_latest_price: None,
            underlying_volatility: None,
        }
    }

    pub fn market_value(&self) -> f64 {
        self.quantity * self.latest_price
    }

    /// Apply a fill of `signed_quantity` at `price`.
    ///
    /// A fill that would leave the quantity negative is rejected with
    /// `ConsistencyDrift` and the position is not touched.
    pub fn apply_fill(
        &mut self,
        signed_quantity: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let resulting = self.quantity + signed_quantity;
        if resulting < -QUANTITY_EPSILON {
            return Err(EngineError::ConsistencyDrift {
                broker: self.broker.clone(),
                symbol: self.symbol.clone(),
                detail: format!(
                    "fill of {} against held {} would leave {} for strategy {}",
                    signed_quantity, self.quantity, resulting, self.strategy
                ),
            });
        }
        self.quantity = if resulting.abs() <= QUANTITY_EPSILON {
            0.0
        } else {
            resulting
        };
        self.latest_price = price;
        self.last_updated = now;
        Ok(())
    }
}
