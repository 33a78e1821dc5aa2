//! Balance entity - point-in-time balance snapshots per (broker, strategy)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Strategy name holding the part of an account no tracked strategy owns
pub const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceType {
    Cash,
    Positions,
    Total,
}

impl BalanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceType::Cash => "cash",
            BalanceType::Positions => "positions",
            BalanceType::Total => "total",
        }
    }
}

impl FromStr for BalanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(BalanceType::Cash),
            "positions" => Ok(BalanceType::Positions),
            "total" => Ok(BalanceType::Total),
            other => Err(format!("Unknown balance type: {}", other)),
        }
    }
}

/// One append-only balance row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub id: i64,
    pub broker: String,
    pub strategy: String,
    pub balance_type: BalanceType,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// Cash and positions value of one strategy at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StrategyBalance {
    pub cash: f64,
    pub positions: f64,
}

impl StrategyBalance {
    pub fn new(cash: f64, positions: f64) -> Self {
        Self { cash, positions }
    }

    pub fn total(&self) -> f64 {
        self.cash + self.positions
    }
}

/// Split of an account's value between tracked strategies and the rest
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncategorizedSplit {
    /// Amount written as the uncategorized balance, never negative
    pub uncategorized: f64,
    /// How far categorized totals exceed the account value (0 when they don't)
    pub over_attributed: f64,
}

/// `max(0, account_total - categorized_total)`, keeping the overshoot visible
pub fn split_uncategorized(account_total: f64, categorized_total: f64) -> UncategorizedSplit {
    let raw = account_total - categorized_total;
    UncategorizedSplit {
        uncategorized: raw.max(0.0),
        over_attributed: (-raw).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_is_cash_plus_positions() {
        let balance = StrategyBalance::new(2500.0, 7500.5);
        assert_eq!(balance.total(), 10000.5);
    }

    #[test]
    fn test_uncategorized_is_remainder() {
        let split = split_uncategorized(50_000.0, 30_000.0);
        assert_eq!(split.uncategorized, 20_000.0);
        assert_eq!(split.over_attributed, 0.0);
    }

    #[test]
    fn test_uncategorized_never_negative() {
        let split = split_uncategorized(10_000.0, 12_500.0);
        assert_eq!(split.uncategorized, 0.0);
        assert_eq!(split.over_attributed, 2_500.0);
    }

    #[test]
    fn test_balance_type_round_trip_names() {
        for ty in [BalanceType::Cash, BalanceType::Positions, BalanceType::Total] {
            assert_eq!(ty.as_str().parse::<BalanceType>().unwrap(), ty);
        }
    }
}
