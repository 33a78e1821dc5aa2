use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Brokerage a configured account lives at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process simulated broker
    Paper,
    Tradier,
    Tastytrade,
    Alpaca,
    Kraken,
}

impl BrokerKind {
    pub fn name(&self) -> &str {
        match self {
            BrokerKind::Paper => "paper",
            BrokerKind::Tradier => "tradier",
            BrokerKind::Tastytrade => "tastytrade",
            BrokerKind::Alpaca => "alpaca",
            BrokerKind::Kraken => "kraken",
        }
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paper" => Ok(BrokerKind::Paper),
            "tradier" => Ok(BrokerKind::Tradier),
            "tastytrade" => Ok(BrokerKind::Tastytrade),
            "alpaca" => Ok(BrokerKind::Alpaca),
            "kraken" => Ok(BrokerKind::Kraken),
            other => Err(format!("Unknown broker kind: {}", other)),
        }
    }
}
