pub mod broker_adapter;
pub mod price_history;
