//! Trade Ledger Library
//!
//! Order and position reconciliation engine: a transactional ledger of
//! trades, positions and balances per (broker, strategy), kept in line with
//! what each broker reports.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod task_runner;
