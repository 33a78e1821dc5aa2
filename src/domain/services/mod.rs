pub mod accounting;
pub mod order_reconciliation;
pub mod position_reconciliation;
pub mod symbols;
pub mod volatility;
