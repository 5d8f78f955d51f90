//! Attested Bitcoin light-client prover
//!
//! This crate validates Bitcoin header chains against a trusted anchor block,
//! chains the results into attested chunk, rollup and anchor proofs, verifies
//! the attested signer and witness quorum over those proofs, and acknowledges
//! included transactions exactly once.

pub mod ack;
pub mod attestation;
pub mod chain;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod difficulty;
pub mod error;
pub mod events;
pub mod inclusion;
pub mod ledger;
pub mod proof;
pub mod prover;
pub mod target;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ack::{AckKey, ConsumerError, TransactionConsumer};
pub use attestation::{AttestationVerifier, ComputationSigner, EnclaveSigner, WitnessKey};
pub use chain::{split_into_chunks, ProofChainEngine, MAX_CHUNK_SIZE};
pub use config::{ProverConfig, MAX_MIN_CONFIRMATIONS};
pub use consumer::{Deposit, DepositCollector};
pub use difficulty::ChainParams;
pub use error::ProverError;
pub use events::{AnchorUpdated, ProverEvent, TransactionAcknowledged};
pub use inclusion::{build_merkle_proof, verify_inclusion, MerkleProofNode};
pub use ledger::AnchorLedger;
pub use proof::{
    AnchorBlock, AnchorBlockRequest, BlockChunkProof, BlockChunkRequest, BlockChunkRollup,
    BlockChunkRollupRequest, ComputationsResult, FullComputationsProof, ProvingAction,
    ProvingRequest, TransactionProof, TransactionRequest,
};
pub use prover::BitcoinProver;
pub use target::{DifficultyTarget, ProofHash};
