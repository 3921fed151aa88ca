use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WalletRegistered,
    WalletFunded,
    MinedBlock,
    ZakatCreated,
}

/// One entry of the persisted system log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemEvent {
    pub event: EventKind,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(event: EventKind, details: impl Into<String>) -> Self {
        SystemEvent { event, details: details.into(), timestamp: Utc::now() }
    }
}
