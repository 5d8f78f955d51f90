//! Error taxonomy shared by every prover operation.

use bitcoin::{BlockHash, Txid};
use thiserror::Error;

/// Errors produced while computing, verifying or acknowledging proofs.
///
/// A rejected operation never mutates ledger or acknowledgment state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProverError {
    /// Structurally invalid input: wrong lengths, undecodable payloads, bad arguments
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    /// Broken chain linkage between headers, chunks, rollups or anchors
    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),
    /// Block hash does not satisfy the in-force target
    #[error("Invalid block hash {block_hash}: proof of work not met")]
    InvalidBlockHash { block_hash: BlockHash },
    /// Header bits disagree with the in-force or retargeted difficulty
    #[error("Invalid difficulty epoch at block {block_hash}: expected bits {expected:#010x}, found {found:#010x}")]
    InvalidDifficultyEpoch {
        block_hash: BlockHash,
        expected: u32,
        found: u32,
    },
    /// Not enough blocks built on top of the claimed block yet
    #[error("Too few confirmations blocks: required {required}, found {found}")]
    TooFewConfirmations { required: u32, found: u32 },
    /// Attested signer signature does not verify
    #[error("Attested signer signature is invalid")]
    SignatureInvalid,
    /// Fewer distinct configured witnesses signed than required
    #[error("Witness quorum not met: required {required}, found {found}")]
    QuorumNotMet { required: usize, found: usize },
    /// Transaction output has already been acknowledged
    #[error("Transaction {tx_hash} output {use_tag} already acknowledged")]
    AlreadyAcknowledged { tx_hash: Txid, use_tag: u32 },
    /// Merkle proof does not lead to the block's merkle root
    #[error("Transaction {0} is not included in the claimed block")]
    NotIncluded(Txid),
    /// Downstream consumer refused the acknowledgment
    #[error("Transaction consumer rejected acknowledgment: {0}")]
    ConsumerRejected(String),
}

impl ProverError {
    /// Advisory errors mean "retry later", the submitted data itself may be fine.
    pub fn is_advisory(&self) -> bool {
        matches!(self, ProverError::TooFewConfirmations { .. })
    }
}

impl From<bincode::Error> for ProverError {
    fn from(err: bincode::Error) -> Self {
        ProverError::MalformedInput(format!("undecodable payload: {err}"))
    }
}

impl From<bitcoin::consensus::encode::Error> for ProverError {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        ProverError::MalformedInput(format!("invalid consensus encoding: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ProverError>;
