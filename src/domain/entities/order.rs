use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(format!("Unknown order side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(format!("Unknown order type: {}", other)),
        }
    }
}

/// How a working order's limit price is managed while it rests at the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStyle {
    /// Limit price is fixed at submission
    #[default]
    Plain,
    /// Limit price tracks the mid price; expired orders are cancelled and resubmitted
    Pegged,
}

impl ExecutionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStyle::Plain => "plain",
            ExecutionStyle::Pegged => "pegged",
        }
    }
}

impl FromStr for ExecutionStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" | "" => Ok(ExecutionStyle::Plain),
            "pegged" => Ok(ExecutionStyle::Pegged),
            other => Err(format!("Unknown execution style: {}", other)),
        }
    }
}

/// An order as handed to a broker adapter
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: f64,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub execution_style: ExecutionStyle,
}

impl OrderRequest {
    pub fn limit(symbol: &str, quantity: f64, side: OrderSide, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            side,
            price: Some(price),
            order_type: OrderType::Limit,
            execution_style: ExecutionStyle::Plain,
        }
    }

    pub fn market(symbol: &str, quantity: f64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            side,
            price: None,
            order_type: OrderType::Market,
            execution_style: ExecutionStyle::Plain,
        }
    }

    pub fn pegged(mut self) -> Self {
        self.execution_style = ExecutionStyle::Pegged;
        self
    }

    /// Check the request before anything is sent to a broker
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("Symbol must not be empty".to_string());
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(format!("Quantity must be positive, got {}", self.quantity));
        }
        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err("Limit orders must have a price".to_string()),
            (_, Some(p)) if !p.is_finite() || p <= 0.0 => {
                Err(format!("Price must be positive, got {}", p))
            }
            (OrderType::Market, _) if self.execution_style == ExecutionStyle::Pegged => {
                Err("Pegged orders must be limit orders".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_order_is_valid() {
        let order = OrderRequest::limit("AAPL", 10.0, OrderSide::Buy, 150.0);
        assert!(order.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_quantity() {
        let order = OrderRequest::market("AAPL", 0.0, OrderSide::Buy);
        assert!(order.validate().is_err());
        let order = OrderRequest::market("AAPL", -1.0, OrderSide::Sell);
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_limit_without_price_rejected() {
        let mut order = OrderRequest::limit("AAPL", 1.0, OrderSide::Buy, 10.0);
        order.price = None;
        assert_eq!(
            order.validate().unwrap_err(),
            "Limit orders must have a price"
        );
    }

    #[test]
    fn test_pegged_market_order_rejected() {
        let order = OrderRequest::market("AAPL", 1.0, OrderSide::Buy).pegged();
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("BUY".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!("sell".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert!("hold".parse::<OrderSide>().is_err());
        assert_eq!(OrderSide::Sell.sign(), -1.0);
    }
}
