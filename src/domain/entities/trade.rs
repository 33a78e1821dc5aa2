//! Trade entity - the ledger record of one order's lifecycle

use crate::domain::entities::order::{ExecutionStyle, OrderSide, OrderType};
use crate::domain::errors::EngineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Trade status. `Open` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Filled,
    Cancelled,
    Stale,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Filled => "filled",
            TradeStatus::Cancelled => "cancelled",
            TradeStatus::Stale => "stale",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Open)
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        matches!(self, TradeStatus::Open) && next.is_terminal()
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TradeStatus::Open),
            "filled" => Ok(TradeStatus::Filled),
            "cancelled" => Ok(TradeStatus::Cancelled),
            "stale" => Ok(TradeStatus::Stale),
            other => Err(format!("Unknown trade status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub symbol: String,
    pub quantity: f64,
    pub side: OrderSide,
    pub requested_price: f64,
    pub executed_price: Option<f64>,
    pub order_type: OrderType,
    pub execution_style: ExecutionStyle,
    pub status: TradeStatus,
    pub broker: String,
    pub broker_order_id: Option<String>,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub profit_loss: Option<f64>,
    pub success: Option<bool>,
    pub replaces_trade_id: Option<i64>,
    pub reprice_count: u32,
}

impl Trade {
    /// Quantity with the side applied: positive for buys, negative for sells
    pub fn signed_quantity(&self) -> f64 {
        self.side.sign() * self.quantity
    }

    /// Realized profit/loss against the requested price.
    ///
    /// Buy: `(executed - requested) * quantity`, sell: `(requested - executed) * quantity`.
    pub fn calculate_profit_loss(&self) -> Result<f64, EngineError> {
        let executed = self
            .executed_price
            .ok_or(EngineError::MissingExecutionPrice { trade_id: self.id })?;
        Ok(match self.side {
            OrderSide::Buy => (executed - self.requested_price) * self.quantity,
            OrderSide::Sell => (self.requested_price - executed) * self.quantity,
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    pub fn is_pegged(&self) -> bool {
        self.execution_style == ExecutionStyle::Pegged
    }

    pub fn transition_to(&mut self, next: TradeStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                trade_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Resolve the trade as filled at `executed_price`, computing profit/loss and success.
    pub fn fill(&mut self, executed_price: f64) -> Result<(), EngineError> {
        self.transition_to(TradeStatus::Filled)?;
        self.executed_price = Some(executed_price);
        let pnl = self.calculate_profit_loss()?;
        self.profit_loss = Some(pnl);
        self.success = Some(pnl > 0.0);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_trade(side: OrderSide, requested: f64, executed: Option<f64>) -> Trade {
    Trade {
        id: 1,
        symbol: "AAPL".to_string(),
        quantity: 10.0,
        side,
        requested_price: requested,
        executed_price: executed,
        order_type: OrderType::Limit,
        execution_style: ExecutionStyle::Plain,
        status: if executed.is_some() {
            TradeStatus::Filled
        } else {
            TradeStatus::Open
        },
        broker: "paper".to_string(),
        broker_order_id: Some("ord-1".to_string()),
        strategy: "momentum".to_string(),
        timestamp: Utc::now(),
        profit_loss: None,
        success: None,
        replaces_trade_id: None,
        reprice_count: 0,
    }
}
