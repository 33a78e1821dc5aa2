pub mod broker_registry;
pub mod guarded_broker;
pub mod paper_broker;
pub mod price_history;
