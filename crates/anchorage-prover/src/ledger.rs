//! Append-only record of committed anchors.

use std::collections::HashMap;

use bitcoin::BlockHash;
use tracing::info;

use crate::attestation::AttestationVerifier;
use crate::difficulty::ChainParams;
use crate::error::{ProverError, Result};
use crate::events::AnchorUpdated;
use crate::proof::{AnchorBlock, AnchorCandidate, FullComputationsProof};

/// Arena of anchors indexed by commit order; the last one is current.
#[derive(Debug, Clone)]
pub struct AnchorLedger {
    retarget_period: u32,
    anchors: Vec<AnchorBlock>,
    index_by_hash: HashMap<BlockHash, u64>,
}

/// Verified candidate waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    index: u64,
    candidate: AnchorCandidate,
}

impl PendingCommit {
    /// Index the anchor receives once applied
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn anchor(&self) -> &AnchorBlock {
        &self.candidate.anchor
    }
}

impl AnchorLedger {
    /// Start a ledger from an operator-chosen seed on an epoch boundary.
    pub fn bootstrap(seed: AnchorBlock, params: &ChainParams) -> Result<Self> {
        Self::restore(vec![seed], params)
    }

    /// Rebuild from persisted anchors in commit order.
    pub fn restore(anchors: Vec<AnchorBlock>, params: &ChainParams) -> Result<Self> {
        let seed = anchors
            .first()
            .ok_or_else(|| ProverError::MalformedInput("no anchors to restore".into()))?;
        if !params.is_epoch_boundary(seed.anchor_block_number) {
            return Err(ProverError::MalformedInput(format!(
                "seed anchor height {} is not an epoch boundary",
                seed.anchor_block_number
            )));
        }
        let mut index_by_hash = HashMap::with_capacity(anchors.len());
        for (index, pair) in anchors.windows(2).enumerate() {
            if pair[1].anchor_block_number
                != pair[0].anchor_block_number + params.retarget_period as u64
            {
                return Err(ProverError::InvalidSequence(format!(
                    "anchor #{} at height {} does not follow height {}",
                    index + 1,
                    pair[1].anchor_block_number,
                    pair[0].anchor_block_number
                )));
            }
        }
        for (index, anchor) in anchors.iter().enumerate() {
            if index_by_hash
                .insert(anchor.anchor_block_hash, index as u64)
                .is_some()
            {
                return Err(ProverError::InvalidSequence(format!(
                    "anchor {} recorded twice",
                    anchor.anchor_block_hash
                )));
            }
        }
        Ok(Self {
            retarget_period: params.retarget_period,
            anchors,
            index_by_hash,
        })
    }

    pub fn current_index(&self) -> u64 {
        self.anchors.len() as u64 - 1
    }

    pub fn current(&self) -> &AnchorBlock {
        &self.anchors[self.anchors.len() - 1]
    }

    pub fn anchor(&self, index: u64) -> Option<&AnchorBlock> {
        self.anchors.get(usize::try_from(index).ok()?)
    }

    pub fn index_of(&self, hash: &BlockHash) -> Option<u64> {
        self.index_by_hash.get(hash).copied()
    }

    pub fn anchors(&self) -> &[AnchorBlock] {
        &self.anchors
    }

    /// Verify an anchor proof against the current state without changing it.
    pub fn stage(
        &self,
        verifier: &AttestationVerifier,
        proof: &FullComputationsProof,
    ) -> Result<PendingCommit> {
        verifier.verify(proof)?;
        let candidate = proof.anchor_candidate()?;
        if let Some(index) = self.index_of(&candidate.anchor.anchor_block_hash) {
            return Err(ProverError::InvalidSequence(format!(
                "anchor {} already committed as #{}",
                candidate.anchor.anchor_block_hash, index
            )));
        }
        self.check_successor(&candidate)?;
        Ok(PendingCommit {
            index: self.current_index() + 1,
            candidate,
        })
    }

    /// Append a staged anchor; fails if another anchor was committed meanwhile.
    pub fn apply(&mut self, pending: PendingCommit) -> Result<AnchorUpdated> {
        self.check_successor(&pending.candidate)?;
        let index = self.current_index() + 1;
        if index != pending.index {
            return Err(ProverError::InvalidSequence(format!(
                "staged for #{}, ledger is at #{}",
                pending.index, index
            )));
        }
        let anchor = pending.candidate.anchor;
        let event = AnchorUpdated {
            index,
            previous_hash: pending.candidate.previous_anchor_hash,
            new_hash: anchor.anchor_block_hash,
        };
        info!(
            "Anchor #{} committed: block {} at height {}",
            index, anchor.anchor_block_hash, anchor.anchor_block_number
        );
        self.index_by_hash.insert(anchor.anchor_block_hash, index);
        self.anchors.push(anchor);
        Ok(event)
    }

    pub fn commit(
        &mut self,
        verifier: &AttestationVerifier,
        proof: &FullComputationsProof,
    ) -> Result<AnchorUpdated> {
        let pending = self.stage(verifier, proof)?;
        self.apply(pending)
    }

    fn check_successor(&self, candidate: &AnchorCandidate) -> Result<()> {
        let current = self.current();
        if candidate.previous_anchor_hash != current.anchor_block_hash {
            return Err(ProverError::InvalidSequence(format!(
                "candidate builds on {}, current anchor is {}",
                candidate.previous_anchor_hash, current.anchor_block_hash
            )));
        }
        let expected = current.anchor_block_number + self.retarget_period as u64;
        if candidate.anchor.anchor_block_number != expected {
            return Err(ProverError::InvalidSequence(format!(
                "candidate height {} is not the next epoch boundary {}",
                candidate.anchor.anchor_block_number, expected
            )));
        }
        Ok(())
    }
}
