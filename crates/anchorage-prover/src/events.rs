//! Notifications emitted on successful state changes.

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};

/// A new anchor superseded the previous one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorUpdated {
    pub index: u64,
    pub previous_hash: BlockHash,
    pub new_hash: BlockHash,
}

/// A transaction output was acknowledged for the first and only time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAcknowledged {
    pub tx_hash: Txid,
    pub use_tag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ProverEvent {
    AnchorUpdated(AnchorUpdated),
    TransactionAcknowledged(TransactionAcknowledged),
}

impl From<AnchorUpdated> for ProverEvent {
    fn from(event: AnchorUpdated) -> Self {
        ProverEvent::AnchorUpdated(event)
    }
}

impl From<TransactionAcknowledged> for ProverEvent {
    fn from(event: TransactionAcknowledged) -> Self {
        ProverEvent::TransactionAcknowledged(event)
    }
}
