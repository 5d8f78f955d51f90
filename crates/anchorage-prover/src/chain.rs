//! Chunk proving, rollup merging and anchor proving.

use bitcoin::BlockHash;
use tracing::debug;

use crate::attestation::AttestationVerifier;
use crate::codec::{decode_header, decode_headers, header_hash};
use crate::difficulty::{
    bits_from_target, check_proof_of_work, target_from_bits, validate_epoch, ChainParams,
    EpochState,
};
use crate::error::{ProverError, Result};
use crate::ledger::AnchorLedger;
use crate::proof::{
    AnchorBlock, AnchorBlockRequest, AnchorCandidate, BlockChunkProof, BlockChunkRollup,
    ComputationsResult, FullComputationsProof,
};
use crate::target::ProofHash;

/// Largest number of headers a single chunk can carry
pub const MAX_CHUNK_SIZE: usize = u8::MAX as usize;

/// Split a header batch into `ceil(len / chunk_size)` chunks, the last one possibly shorter.
pub fn split_into_chunks<T>(items: &[T], chunk_size: usize) -> Result<Vec<&[T]>> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(ProverError::MalformedInput(format!(
            "chunk size must be within 1..={MAX_CHUNK_SIZE}, got {chunk_size}"
        )));
    }
    Ok(items.chunks(chunk_size).collect())
}

/// Position of the last validated header.
#[derive(Debug, Clone, Copy)]
struct ChainCursor {
    delta: i32,
    block_hash: BlockHash,
    block_timestamp: u32,
    epoch: EpochState,
}

impl ChainCursor {
    fn at_anchor(anchor: &AnchorBlock) -> Self {
        Self {
            delta: 0,
            block_hash: anchor.anchor_block_hash,
            block_timestamp: anchor.anchor_block_timestamp,
            epoch: EpochState {
                target: anchor.current_difficulty_target,
                previous_target: anchor.previous_difficulty_target,
                virtual_epoch_index: 0,
                epoch_start_timestamp: anchor.anchor_block_timestamp,
            },
        }
    }

    fn after_chunk(chunk: &BlockChunkProof) -> Self {
        Self {
            delta: chunk.end_block_number_delta(),
            block_hash: chunk.end_block_hash,
            block_timestamp: chunk.end_block_timestamp,
            epoch: EpochState {
                target: chunk.end_chunk_target,
                previous_target: chunk.previous_epoch_target,
                virtual_epoch_index: chunk.virtual_epoch_index,
                epoch_start_timestamp: chunk.epoch_start_timestamp,
            },
        }
    }
}

/// Stateless proving rules evaluated against the committed anchors.
pub struct ProofChainEngine<'a> {
    params: &'a ChainParams,
    verifier: &'a AttestationVerifier,
    ledger: &'a AnchorLedger,
    min_confirmations: u32,
}

impl<'a> ProofChainEngine<'a> {
    pub fn new(
        params: &'a ChainParams,
        verifier: &'a AttestationVerifier,
        ledger: &'a AnchorLedger,
        min_confirmations: u32,
    ) -> Self {
        Self {
            params,
            verifier,
            ledger,
            min_confirmations,
        }
    }

    pub(crate) fn verifier(&self) -> &AttestationVerifier {
        self.verifier
    }

    pub(crate) fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    pub(crate) fn committed_anchor(&self, anchor_index: u64) -> Result<&'a AnchorBlock> {
        self.ledger.anchor(anchor_index).ok_or_else(|| {
            ProverError::InvalidSequence(format!("anchor #{anchor_index} is not committed"))
        })
    }

    /// Validate `raw_headers` as the continuation of `prev_proof`, or of the anchor
    /// when `prev_proof` is the empty sentinel.
    pub fn prove_chunk(
        &self,
        prev_proof: &FullComputationsProof,
        raw_headers: &[u8],
        anchor_index: u64,
    ) -> Result<BlockChunkProof> {
        let anchor = self.committed_anchor(anchor_index)?;
        let (mut cursor, prev_chunk_proof_hash) = if prev_proof.is_empty() {
            (ChainCursor::at_anchor(anchor), ProofHash::ZERO)
        } else {
            self.verifier.verify(prev_proof)?;
            let prev = prev_proof.block_chunk()?;
            if prev.anchor_index != anchor_index {
                return Err(ProverError::InvalidSequence(format!(
                    "previous chunk is relative to anchor #{}, expected #{}",
                    prev.anchor_index, anchor_index
                )));
            }
            (ChainCursor::after_chunk(&prev), prev_proof.proof_hash())
        };

        let headers = decode_headers(raw_headers)?;
        if headers.len() > MAX_CHUNK_SIZE {
            return Err(ProverError::MalformedInput(format!(
                "Invalid blockheaders size: {} headers exceed chunk limit {}",
                headers.len(),
                MAX_CHUNK_SIZE
            )));
        }

        let start_block_number_delta = cursor.delta + 1;
        let start_block_hash = header_hash(&headers[0]);

        for header in &headers {
            if header.prev_blockhash != cursor.block_hash {
                return Err(ProverError::InvalidSequence(format!(
                    "Invalid seq: block {} does not build on {}",
                    header_hash(header),
                    cursor.block_hash
                )));
            }
            let delta = cursor.delta + 1;
            let epoch = validate_epoch(
                header,
                delta as u64,
                cursor.block_timestamp,
                &cursor.epoch,
                self.params,
            )?;
            check_proof_of_work(header, &epoch.target)?;
            cursor = ChainCursor {
                delta,
                block_hash: header_hash(header),
                block_timestamp: header.time,
                epoch,
            };
        }

        debug!(
            "Proved chunk of {} headers at deltas {}..={} from anchor #{}",
            headers.len(),
            start_block_number_delta,
            cursor.delta,
            anchor_index
        );

        Ok(BlockChunkProof {
            anchor_index,
            prev_chunk_proof_hash,
            start_block_number_delta,
            start_block_hash,
            chunk_size: headers.len() as u8,
            end_block_hash: cursor.block_hash,
            end_chunk_target: cursor.epoch.target,
            previous_epoch_target: cursor.epoch.previous_target,
            virtual_epoch_index: cursor.epoch.virtual_epoch_index,
            epoch_start_timestamp: cursor.epoch.epoch_start_timestamp,
            end_block_timestamp: cursor.block_timestamp,
        })
    }

    /// Reduce hash-linked chunk or rollup proofs into one claim.
    pub fn merge_rollup(&self, proofs: &[FullComputationsProof]) -> Result<BlockChunkRollup> {
        let (first, rest) = proofs
            .split_first()
            .ok_or_else(|| ProverError::MalformedInput("nothing to roll up".into()))?;

        let mut rollup = self.linked_span(first)?;
        for proof in rest {
            let next = self.linked_span(proof)?;
            if next.anchor_index != rollup.anchor_index {
                return Err(ProverError::InvalidSequence(format!(
                    "cannot merge proofs relative to anchors #{} and #{}",
                    rollup.anchor_index, next.anchor_index
                )));
            }
            if next.prev_chunk_proof_hash != rollup.last_chunk_proof_hash
                || next.start_block_number_delta != rollup.end_block_number_delta + 1
            {
                return Err(ProverError::InvalidSequence(format!(
                    "Invalid seq: proof at delta {} does not link to delta {}",
                    next.start_block_number_delta, rollup.end_block_number_delta
                )));
            }
            rollup.end_block_number_delta = next.end_block_number_delta;
            rollup.end_block_hash = next.end_block_hash;
            rollup.last_chunk_proof_hash = next.last_chunk_proof_hash;
        }
        Ok(rollup)
    }

    fn linked_span(&self, proof: &FullComputationsProof) -> Result<BlockChunkRollup> {
        self.verifier.verify(proof)?;
        match proof.result()? {
            ComputationsResult::BlockChunk(chunk) => Ok(BlockChunkRollup {
                anchor_index: chunk.anchor_index,
                prev_chunk_proof_hash: chunk.prev_chunk_proof_hash,
                start_block_number_delta: chunk.start_block_number_delta,
                start_block_hash: chunk.start_block_hash,
                end_block_number_delta: chunk.end_block_number_delta(),
                end_block_hash: chunk.end_block_hash,
                last_chunk_proof_hash: proof.proof_hash(),
            }),
            ComputationsResult::BlockChunkRollup(rollup) => Ok(rollup),
            other => Err(ProverError::MalformedInput(format!(
                "cannot roll up a {:?} result",
                other.action()
            ))),
        }
    }

    /// Derive the next anchor from a full-epoch rollup and its confirmations.
    pub fn prove_anchor(&self, request: &AnchorBlockRequest) -> Result<AnchorCandidate> {
        self.verifier.verify(&request.epoch_rollup_proof)?;
        let rollup = request.epoch_rollup_proof.rollup()?;

        let current_index = self.ledger.current_index();
        if rollup.anchor_index != current_index {
            return Err(ProverError::InvalidSequence(format!(
                "rollup is relative to anchor #{}, current anchor is #{}",
                rollup.anchor_index, current_index
            )));
        }
        let anchor = self.ledger.current();
        let period = self.params.retarget_period as i32;
        if !rollup.prev_chunk_proof_hash.is_zero()
            || rollup.start_block_number_delta != 1
            || rollup.end_block_number_delta != period
        {
            return Err(ProverError::InvalidSequence(format!(
                "rollup covers deltas {}..={}, expected one epoch 1..={}",
                rollup.start_block_number_delta, rollup.end_block_number_delta, period
            )));
        }

        self.verifier.verify(&request.confirmations_proof)?;
        let confirmations = request.confirmations_proof.block_chunk()?;
        if confirmations.anchor_index != rollup.anchor_index
            || confirmations.prev_chunk_proof_hash != rollup.last_chunk_proof_hash
            || confirmations.start_block_number_delta != rollup.end_block_number_delta + 1
        {
            return Err(ProverError::InvalidSequence(
                "confirmations chunk does not extend the epoch rollup".into(),
            ));
        }
        if (confirmations.chunk_size as u32) < self.min_confirmations {
            return Err(ProverError::TooFewConfirmations {
                required: self.min_confirmations,
                found: confirmations.chunk_size as u32,
            });
        }

        let start = decode_header(&request.epoch_start_header)?;
        if header_hash(&start) != rollup.start_block_hash
            || start.prev_blockhash != anchor.anchor_block_hash
        {
            return Err(ProverError::InvalidSequence(
                "epoch start header does not match the rollup start".into(),
            ));
        }
        let end = decode_header(&request.epoch_end_header)?;
        if header_hash(&end) != rollup.end_block_hash {
            return Err(ProverError::InvalidSequence(
                "epoch end header does not match the rollup end".into(),
            ));
        }

        let previous_difficulty_target = target_from_bits(start.bits.to_consensus())?;
        if previous_difficulty_target != anchor.current_difficulty_target {
            return Err(ProverError::InvalidDifficultyEpoch {
                block_hash: rollup.start_block_hash,
                expected: bits_from_target(&anchor.current_difficulty_target),
                found: start.bits.to_consensus(),
            });
        }

        let candidate = AnchorCandidate {
            previous_anchor_hash: anchor.anchor_block_hash,
            anchor: AnchorBlock {
                current_difficulty_target: target_from_bits(end.bits.to_consensus())?,
                previous_difficulty_target,
                anchor_block_number: anchor.anchor_block_number
                    + self.params.retarget_period as u64,
                anchor_block_hash: rollup.end_block_hash,
                anchor_block_timestamp: end.time,
            },
        };
        debug!(
            "Proved anchor candidate #{} {}",
            candidate.anchor.anchor_block_number, candidate.anchor.anchor_block_hash
        );
        Ok(candidate)
    }
}
