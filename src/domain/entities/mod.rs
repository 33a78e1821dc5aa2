pub mod account;
pub mod balance;
pub mod broker;
pub mod order;
pub mod position;
pub mod trade;
