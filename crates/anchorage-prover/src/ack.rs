//! One-time acknowledgment of proven transaction outputs.

use std::collections::HashSet;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::attestation::AttestationVerifier;
use crate::error::{ProverError, Result};
use crate::events::TransactionAcknowledged;
use crate::ledger::AnchorLedger;
use crate::proof::{FullComputationsProof, TransactionProof};

/// Refusal reported by a consumer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConsumerError(pub String);

/// Downstream receiver of acknowledged transactions, e.g. a wallet crediting deposits.
#[cfg_attr(test, mockall::automock)]
pub trait TransactionConsumer {
    /// Called exactly once per acknowledged output; an error aborts the acknowledgment.
    fn on_transaction(
        &mut self,
        proof: &TransactionProof,
        aux_data: &[u8],
    ) -> std::result::Result<(), ConsumerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckKey {
    pub tx_hash: Txid,
    pub use_tag: u32,
}

/// Idempotency table of acknowledged outputs.
#[derive(Debug, Clone, Default)]
pub struct AckTable {
    acknowledged: HashSet<AckKey>,
}

impl AckTable {
    pub fn restore(keys: impl IntoIterator<Item = AckKey>) -> Self {
        Self {
            acknowledged: keys.into_iter().collect(),
        }
    }

    pub fn contains(&self, key: &AckKey) -> bool {
        self.acknowledged.contains(key)
    }

    pub fn len(&self) -> usize {
        self.acknowledged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acknowledged.is_empty()
    }

    /// Verify a transaction proof, hand it to the consumer and record it.
    pub fn acknowledge(
        &mut self,
        verifier: &AttestationVerifier,
        ledger: &AnchorLedger,
        min_confirmations: u32,
        proof: &FullComputationsProof,
        consumer: &mut dyn TransactionConsumer,
        aux_data: &[u8],
    ) -> Result<TransactionAcknowledged> {
        verifier.verify(proof)?;
        let tx_proof = proof.transaction()?;
        if !tx_proof.included {
            return Err(ProverError::NotIncluded(tx_proof.tx_hash()));
        }
        if ledger.anchor(tx_proof.anchor_index).is_none() {
            return Err(ProverError::InvalidSequence(format!(
                "anchor #{} is not committed",
                tx_proof.anchor_index
            )));
        }
        if tx_proof.confirmations < min_confirmations {
            return Err(ProverError::TooFewConfirmations {
                required: min_confirmations,
                found: tx_proof.confirmations,
            });
        }

        let key = AckKey {
            tx_hash: tx_proof.tx_hash(),
            use_tag: tx_proof.output_index,
        };
        if self.contains(&key) {
            return Err(ProverError::AlreadyAcknowledged {
                tx_hash: key.tx_hash,
                use_tag: key.use_tag,
            });
        }

        consumer
            .on_transaction(&tx_proof, aux_data)
            .map_err(|e| ProverError::ConsumerRejected(e.to_string()))?;
        self.acknowledged.insert(key);
        info!(
            "Transaction {} output {} acknowledged in block {}",
            key.tx_hash, key.use_tag, tx_proof.block_hash
        );

        Ok(TransactionAcknowledged {
            tx_hash: key.tx_hash,
            use_tag: key.use_tag,
        })
    }
}
