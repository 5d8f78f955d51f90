//! Proof payloads exchanged between the computation unit and verifiers.
//!
//! Every computation result is bincode encoded before signing, so the encoding
//! is part of the protocol: the variant order of [`ComputationsResult`] and
//! [`ProvingRequest`] fixes the action tags.

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{ProverError, Result};
use crate::inclusion::{DecodedTransaction, MerkleProofNode};
use crate::target::{DifficultyTarget, ProofHash};

/// Action tags accepted by `compute`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvingAction {
    BlockChunk = 0,
    Transaction = 1,
    AnchorBlock = 2,
    BlockChunkRollup = 3,
}

impl TryFrom<u8> for ProvingAction {
    type Error = ProverError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ProvingAction::BlockChunk),
            1 => Ok(ProvingAction::Transaction),
            2 => Ok(ProvingAction::AnchorBlock),
            3 => Ok(ProvingAction::BlockChunkRollup),
            other => Err(ProverError::MalformedInput(format!(
                "unknown proving action tag {other}"
            ))),
        }
    }
}

/// Trusted epoch-boundary block every proof is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorBlock {
    /// Target of the epoch the anchor opens
    pub current_difficulty_target: DifficultyTarget,
    /// Target of the epoch before it
    pub previous_difficulty_target: DifficultyTarget,
    pub anchor_block_number: u64,
    pub anchor_block_hash: BlockHash,
    /// Start time of the anchor's epoch, i.e. the anchor's own timestamp
    pub anchor_block_timestamp: u32,
}

/// Result of an anchor computation, pending commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorCandidate {
    /// Hash of the anchor this candidate supersedes
    pub previous_anchor_hash: BlockHash,
    pub anchor: AnchorBlock,
}

/// Claim that a run of consecutive headers extends the chain validly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChunkProof {
    /// Index of the committed anchor the deltas are relative to
    pub anchor_index: u64,
    /// Hash of the previous chunk's computation result, zero after the anchor
    pub prev_chunk_proof_hash: ProofHash,
    /// Distance of the first header from the anchor, 1 for the anchor's child
    pub start_block_number_delta: i32,
    pub start_block_hash: BlockHash,
    pub chunk_size: u8,
    pub end_block_hash: BlockHash,
    /// Target in force at the last header
    pub end_chunk_target: DifficultyTarget,
    /// Target of the epoch before the one in force at the last header
    pub previous_epoch_target: DifficultyTarget,
    /// Epochs crossed since the anchor
    pub virtual_epoch_index: u32,
    /// Start time of the epoch in force at the last header
    pub epoch_start_timestamp: u32,
    pub end_block_timestamp: u32,
}

impl BlockChunkProof {
    pub fn end_block_number_delta(&self) -> i32 {
        self.start_block_number_delta + self.chunk_size as i32 - 1
    }
}

/// Merge of consecutive chunk proofs into one start/end claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChunkRollup {
    pub anchor_index: u64,
    /// Link into the first merged chunk
    pub prev_chunk_proof_hash: ProofHash,
    pub start_block_number_delta: i32,
    pub start_block_hash: BlockHash,
    pub end_block_number_delta: i32,
    pub end_block_hash: BlockHash,
    /// Hash of the last merged chunk's computation result
    pub last_chunk_proof_hash: ProofHash,
}

/// Result of the transaction action: the claimed output and its inclusion status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionProof {
    pub transaction: DecodedTransaction,
    /// Output the acknowledgment is for
    pub output_index: u32,
    pub block_hash: BlockHash,
    pub block_number: u64,
    pub anchor_index: u64,
    /// Blocks built on top of the containing block
    pub confirmations: u32,
    /// Whether the merkle proof folds to the header's merkle root
    pub included: bool,
}

impl TransactionProof {
    pub fn tx_hash(&self) -> Txid {
        self.transaction.txid
    }
}

/// Signed computation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputationsResult {
    BlockChunk(BlockChunkProof),
    Transaction(TransactionProof),
    AnchorBlock(AnchorCandidate),
    BlockChunkRollup(BlockChunkRollup),
}

impl ComputationsResult {
    pub fn action(&self) -> ProvingAction {
        match self {
            ComputationsResult::BlockChunk(_) => ProvingAction::BlockChunk,
            ComputationsResult::Transaction(_) => ProvingAction::Transaction,
            ComputationsResult::AnchorBlock(_) => ProvingAction::AnchorBlock,
            ComputationsResult::BlockChunkRollup(_) => ProvingAction::BlockChunkRollup,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Result bytes plus the attested signer's recoverable signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialComputationsProof {
    pub computations_result: Vec<u8>,
    pub contract_signature: Vec<u8>,
}

/// Witness co-signature: compressed public key and DER signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSignature {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullComputationsProof {
    pub partial_proof: PartialComputationsProof,
    pub witness_signatures: Vec<WitnessSignature>,
}

impl FullComputationsProof {
    /// Sentinel meaning "start from the anchor".
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.partial_proof.computations_result.is_empty()
            && self.partial_proof.contract_signature.is_empty()
    }

    /// Link value the next proof must carry.
    pub fn proof_hash(&self) -> ProofHash {
        ProofHash::of(&self.partial_proof.computations_result)
    }

    /// Decode the payload without checking signatures.
    pub fn result(&self) -> Result<ComputationsResult> {
        ComputationsResult::decode(&self.partial_proof.computations_result)
    }

    pub fn block_chunk(&self) -> Result<BlockChunkProof> {
        match self.result()? {
            ComputationsResult::BlockChunk(chunk) => Ok(chunk),
            other => Err(unexpected(ProvingAction::BlockChunk, other.action())),
        }
    }

    pub fn rollup(&self) -> Result<BlockChunkRollup> {
        match self.result()? {
            ComputationsResult::BlockChunkRollup(rollup) => Ok(rollup),
            other => Err(unexpected(ProvingAction::BlockChunkRollup, other.action())),
        }
    }

    pub fn anchor_candidate(&self) -> Result<AnchorCandidate> {
        match self.result()? {
            ComputationsResult::AnchorBlock(candidate) => Ok(candidate),
            other => Err(unexpected(ProvingAction::AnchorBlock, other.action())),
        }
    }

    pub fn transaction(&self) -> Result<TransactionProof> {
        match self.result()? {
            ComputationsResult::Transaction(tx) => Ok(tx),
            other => Err(unexpected(ProvingAction::Transaction, other.action())),
        }
    }
}

fn unexpected(expected: ProvingAction, found: ProvingAction) -> ProverError {
    ProverError::MalformedInput(format!(
        "expected {expected:?} computation result, found {found:?}"
    ))
}

/// Payload of [`ProvingAction::BlockChunk`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChunkRequest {
    /// Previous chunk proof or [`FullComputationsProof::empty`]
    pub prev_proof: FullComputationsProof,
    /// Concatenated 80-byte headers
    pub raw_headers: Vec<u8>,
    pub anchor_index: u64,
}

/// Payload of [`ProvingAction::Transaction`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub raw_transaction: Vec<u8>,
    pub merkle_proof: Vec<MerkleProofNode>,
    pub output_index: u32,
    pub raw_block_header: Vec<u8>,
    /// Chunk starting at the containing block and covering its confirmations
    pub chunk_proof: FullComputationsProof,
}

/// Payload of [`ProvingAction::AnchorBlock`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorBlockRequest {
    pub epoch_rollup_proof: FullComputationsProof,
    pub confirmations_proof: FullComputationsProof,
    /// First header after the current anchor
    pub epoch_start_header: Vec<u8>,
    /// Header opening the next epoch
    pub epoch_end_header: Vec<u8>,
}

/// Payload of [`ProvingAction::BlockChunkRollup`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChunkRollupRequest {
    pub proofs: Vec<FullComputationsProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvingRequest {
    BlockChunk(BlockChunkRequest),
    Transaction(TransactionRequest),
    AnchorBlock(AnchorBlockRequest),
    BlockChunkRollup(BlockChunkRollupRequest),
}

impl ProvingRequest {
    pub fn action(&self) -> ProvingAction {
        match self {
            ProvingRequest::BlockChunk(_) => ProvingAction::BlockChunk,
            ProvingRequest::Transaction(_) => ProvingAction::Transaction,
            ProvingRequest::AnchorBlock(_) => ProvingAction::AnchorBlock,
            ProvingRequest::BlockChunkRollup(_) => ProvingAction::BlockChunkRollup,
        }
    }

    /// Bincode encoding of the inner request, the `compute` payload for [`Self::action`].
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            ProvingRequest::BlockChunk(req) => bincode::serialize(req),
            ProvingRequest::Transaction(req) => bincode::serialize(req),
            ProvingRequest::AnchorBlock(req) => bincode::serialize(req),
            ProvingRequest::BlockChunkRollup(req) => bincode::serialize(req),
        };
        Ok(payload?)
    }

    pub fn decode_payload(action: ProvingAction, payload: &[u8]) -> Result<Self> {
        Ok(match action {
            ProvingAction::BlockChunk => ProvingRequest::BlockChunk(bincode::deserialize(payload)?),
            ProvingAction::Transaction => {
                ProvingRequest::Transaction(bincode::deserialize(payload)?)
            }
            ProvingAction::AnchorBlock => {
                ProvingRequest::AnchorBlock(bincode::deserialize(payload)?)
            }
            ProvingAction::BlockChunkRollup => {
                ProvingRequest::BlockChunkRollup(bincode::deserialize(payload)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn sample_rollup() -> BlockChunkRollup {
        BlockChunkRollup {
            anchor_index: 3,
            prev_chunk_proof_hash: ProofHash::ZERO,
            start_block_number_delta: 1,
            start_block_hash: BlockHash::all_zeros(),
            end_block_number_delta: 2016,
            end_block_hash: BlockHash::all_zeros(),
            last_chunk_proof_hash: ProofHash::of(b"last"),
        }
    }

    #[test]
    fn test_result_tag_matches_action() {
        let result = ComputationsResult::BlockChunkRollup(sample_rollup());
        let encoded = result.encode().unwrap();
        // bincode writes the variant index as a little-endian u32
        assert_eq!(&encoded[..4], &[ProvingAction::BlockChunkRollup as u8, 0, 0, 0]);
        assert_eq!(ComputationsResult::decode(&encoded).unwrap(), result);
    }

    #[test]
    fn test_action_from_tag() {
        assert_eq!(ProvingAction::try_from(2).unwrap(), ProvingAction::AnchorBlock);
        assert!(matches!(
            ProvingAction::try_from(4),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_typed_accessors_reject_other_actions() {
        let result = ComputationsResult::BlockChunkRollup(sample_rollup());
        let proof = FullComputationsProof {
            partial_proof: PartialComputationsProof {
                computations_result: result.encode().unwrap(),
                contract_signature: vec![],
            },
            witness_signatures: vec![],
        };
        assert_eq!(proof.rollup().unwrap(), sample_rollup());
        assert!(matches!(
            proof.block_chunk(),
            Err(ProverError::MalformedInput(_))
        ));
        assert!(!proof.is_empty());
        assert!(FullComputationsProof::empty().is_empty());
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(
            ComputationsResult::decode(&[9, 0, 0, 0, 1]),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_request_payload_roundtrip() {
        let request = ProvingRequest::BlockChunkRollup(BlockChunkRollupRequest {
            proofs: vec![FullComputationsProof::empty()],
        });
        let payload = request.encode_payload().unwrap();
        let decoded = ProvingRequest::decode_payload(request.action(), &payload).unwrap();
        assert_eq!(decoded, request);
    }
}
