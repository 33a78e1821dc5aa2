//! Database Models
//!
//! Row structs for the ledger tables and their conversions into domain types.

use super::DatabaseError;
use crate::domain::entities::account::AccountSnapshot;
use crate::domain::entities::balance::{BalanceSnapshot, BalanceType};
use crate::domain::entities::order::{ExecutionStyle, OrderSide, OrderType};
use crate::domain::entities::position::Position;
use crate::domain::entities::trade::{Trade, TradeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// Trade record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub symbol: String,
    pub quantity: f64,
    pub side: String,
    pub requested_price: f64,
    pub executed_price: Option<f64>,
    pub order_type: String,
    pub execution_style: String,
    pub status: String,
    pub broker: String,
    pub broker_order_id: Option<String>,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub profit_loss: Option<f64>,
    pub success: Option<bool>,
    pub replaces_trade_id: Option<i64>,
    pub reprice_count: i64,
}

/// Position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
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

/// Balance record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceRecord {
    pub id: i64,
    pub broker: String,
    pub strategy: String,
    pub balance_type: String,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// Account snapshot record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountSnapshotRecord {
    pub id: i64,
    pub broker: String,
    pub buying_power: f64,
    pub cash: f64,
    pub total_value: f64,
    pub updated_at: DateTime<Utc>,
}

/// Create trade input
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub symbol: String,
    pub quantity: f64,
    pub side: OrderSide,
    pub requested_price: f64,
    pub order_type: OrderType,
    pub execution_style: ExecutionStyle,
    pub broker: String,
    pub broker_order_id: Option<String>,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub replaces_trade_id: Option<i64>,
    pub reprice_count: u32,
}

fn parse_field<T: FromStr<Err = String>>(
    table: &str,
    id: i64,
    value: &str,
) -> Result<T, DatabaseError> {
    T::from_str(value)
        .map_err(|e| DatabaseError::CorruptRecord(format!("{} row {}: {}", table, id, e)))
}

impl TryFrom<TradeRecord> for Trade {
    type Error = DatabaseError;

    fn try_from(record: TradeRecord) -> Result<Self, Self::Error> {
        let reprice_count = u32::try_from(record.reprice_count).map_err(|_| {
            DatabaseError::CorruptRecord(format!(
                "trades row {}: reprice_count {}",
                record.id, record.reprice_count
            ))
        })?;

        Ok(Trade {
            id: record.id,
            side: parse_field("trades", record.id, &record.side)?,
            order_type: parse_field("trades", record.id, &record.order_type)?,
            execution_style: parse_field("trades", record.id, &record.execution_style)?,
            status: parse_field::<TradeStatus>("trades", record.id, &record.status)?,
            symbol: record.symbol,
            quantity: record.quantity,
            requested_price: record.requested_price,
            executed_price: record.executed_price,
            broker: record.broker,
            broker_order_id: record.broker_order_id,
            strategy: record.strategy,
            timestamp: record.timestamp,
            profit_loss: record.profit_loss,
            success: record.success,
            replaces_trade_id: record.replaces_trade_id,
            reprice_count,
        })
    }
}

impl From<PositionRecord> for Position {
    fn from(record: PositionRecord) -> Self {
        Position {
            id: record.id,
            broker: record.broker,
            strategy: record.strategy,
            symbol: record.symbol,
            quantity: record.quantity,
            latest_price: record.latest_price,
            last_updated: record.last_updated,
            underlying_symbol: record.underlying_symbol,
            underlying_latest_price: record.underlying_latest_price,
            underlying_volatility: record.underlying_volatility,
        }
    }
}

impl TryFrom<BalanceRecord> for BalanceSnapshot {
    type Error = DatabaseError;

    fn try_from(record: BalanceRecord) -> Result<Self, Self::Error> {
        Ok(BalanceSnapshot {
            id: record.id,
            balance_type: parse_field::<BalanceType>("balances", record.id, &record.balance_type)?,
            broker: record.broker,
            strategy: record.strategy,
            amount: record.amount,
            timestamp: record.timestamp,
        })
    }
}

impl From<AccountSnapshotRecord> for AccountSnapshot {
    fn from(record: AccountSnapshotRecord) -> Self {
        AccountSnapshot {
            broker: record.broker,
            buying_power: record.buying_power,
            cash: record.cash,
            total_value: record.total_value,
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(side: &str, status: &str) -> TradeRecord {
        TradeRecord {
            id: 3,
            symbol: "AAPL".into(),
            quantity: 2.0,
            side: side.into(),
            requested_price: 10.0,
            executed_price: None,
            order_type: "limit".into(),
            execution_style: "pegged".into(),
            status: status.into(),
            broker: "paper".into(),
            broker_order_id: None,
            strategy: "momentum".into(),
            timestamp: Utc::now(),
            profit_loss: None,
            success: None,
            replaces_trade_id: Some(2),
            reprice_count: 1,
        }
    }

    #[test]
    fn test_trade_record_converts() {
        let trade = Trade::try_from(record("sell", "open")).unwrap();
        assert_eq!(trade.side, OrderSide::Sell);
        assert_eq!(trade.execution_style, ExecutionStyle::Pegged);
        assert_eq!(trade.replaces_trade_id, Some(2));
        assert_eq!(trade.reprice_count, 1);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = Trade::try_from(record("buy", "partially_filled")).unwrap_err();
        assert!(matches!(err, DatabaseError::CorruptRecord(_)));
    }
}
