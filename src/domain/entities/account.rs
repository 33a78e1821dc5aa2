use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::repositories::broker_adapter::AccountInfo;

/// Latest broker-reported account summary; one current row per broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub broker: String,
    pub buying_power: f64,
    pub cash: f64,
    pub total_value: f64,
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn from_info(broker: &str, info: &AccountInfo, now: DateTime<Utc>) -> Self {
        Self {
            broker: broker.to_string(),
            buying_power: info.buying_power,
            cash: info.cash,
            total_value: info.total_value,
            updated_at: now,
        }
    }
}
