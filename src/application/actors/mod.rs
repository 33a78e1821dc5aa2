pub mod circuit_breaker;
pub mod reconciliation_actor;

pub use circuit_breaker::*;
pub use reconciliation_actor::*;
