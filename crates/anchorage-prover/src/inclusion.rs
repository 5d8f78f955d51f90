//! Transaction decoding, merkle inclusion and the transaction proving action.

use bitcoin::consensus::deserialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::ProofChainEngine;
use crate::codec::{decode_header, header_hash};
use crate::error::{ProverError, Result};
use crate::proof::{TransactionProof, TransactionRequest};

/// One step of a merkle branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProofNode {
    /// Sibling is the left operand of the concatenation
    pub is_left: bool,
    /// Sibling hash in internal byte order
    pub data: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInput {
    pub previous_output: OutPoint,
    pub script_sig: ScriptBuf,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedOutput {
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

/// Transaction fields without witness data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    /// Legacy serialization hash, unaffected by witnesses
    pub txid: Txid,
    pub version: i32,
    pub inputs: Vec<DecodedInput>,
    pub outputs: Vec<DecodedOutput>,
    pub lock_time: u32,
}

impl From<&Transaction> for DecodedTransaction {
    fn from(tx: &Transaction) -> Self {
        Self {
            txid: tx.compute_txid(),
            version: tx.version.0,
            inputs: tx
                .input
                .iter()
                .map(|input| DecodedInput {
                    previous_output: input.previous_output,
                    script_sig: input.script_sig.clone(),
                    sequence: input.sequence.0,
                })
                .collect(),
            outputs: tx
                .output
                .iter()
                .map(|output| DecodedOutput {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                })
                .collect(),
            lock_time: tx.lock_time.to_consensus_u32(),
        }
    }
}

/// Parse a raw transaction, segwit or legacy; trailing bytes are rejected.
pub fn decode_transaction(raw: &[u8]) -> Result<DecodedTransaction> {
    let tx: Transaction = deserialize(raw)?;
    Ok(DecodedTransaction::from(&tx))
}

/// Fold a branch bottom-up starting from the transaction hash.
pub fn fold_merkle_proof(txid: &Txid, proof: &[MerkleProofNode]) -> TxMerkleNode {
    let mut current = txid.to_byte_array();
    for node in proof {
        let mut preimage = [0u8; 64];
        if node.is_left {
            preimage[..32].copy_from_slice(&node.data);
            preimage[32..].copy_from_slice(&current);
        } else {
            preimage[..32].copy_from_slice(&current);
            preimage[32..].copy_from_slice(&node.data);
        }
        current = sha256d::Hash::hash(&preimage).to_byte_array();
    }
    TxMerkleNode::from_byte_array(current)
}

/// Check that `raw_tx` is committed to by the header's merkle root.
pub fn verify_inclusion(
    raw_tx: &[u8],
    raw_block_header: &[u8],
    proof: &[MerkleProofNode],
) -> Result<bool> {
    let tx = decode_transaction(raw_tx)?;
    let header = decode_header(raw_block_header)?;
    Ok(fold_merkle_proof(&tx.txid, proof) == header.merkle_root)
}

/// Branch for `txids[index]`, duplicating the last node of odd levels.
pub fn build_merkle_proof(txids: &[Txid], index: usize) -> Option<Vec<MerkleProofNode>> {
    if index >= txids.len() {
        return None;
    }
    let mut level: Vec<[u8; 32]> = txids.iter().map(|txid| txid.to_byte_array()).collect();
    let mut position = index;
    let mut proof = Vec::new();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1]);
        }
        let sibling = position ^ 1;
        proof.push(MerkleProofNode {
            is_left: sibling < position,
            data: level[sibling],
        });
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut preimage = [0u8; 64];
                preimage[..32].copy_from_slice(&pair[0]);
                preimage[32..].copy_from_slice(&pair[1]);
                sha256d::Hash::hash(&preimage).to_byte_array()
            })
            .collect();
        position /= 2;
    }
    Some(proof)
}

impl ProofChainEngine<'_> {
    /// Validate a transaction claim against an attested confirmations chunk.
    pub fn prove_transaction(&self, request: &TransactionRequest) -> Result<TransactionProof> {
        self.verifier().verify(&request.chunk_proof)?;
        let chunk = request.chunk_proof.block_chunk()?;
        let anchor = self.committed_anchor(chunk.anchor_index)?;

        let header = decode_header(&request.raw_block_header)?;
        let block_hash = header_hash(&header);
        if block_hash != chunk.start_block_hash {
            return Err(ProverError::InvalidSequence(format!(
                "block {} is not the first block of the confirmations chunk",
                block_hash
            )));
        }
        let confirmations = (chunk.chunk_size as u32).saturating_sub(1);
        if confirmations < self.min_confirmations() {
            return Err(ProverError::TooFewConfirmations {
                required: self.min_confirmations(),
                found: confirmations,
            });
        }

        let transaction = decode_transaction(&request.raw_transaction)?;
        if request.output_index as usize >= transaction.outputs.len() {
            return Err(ProverError::MalformedInput(format!(
                "output index {} out of range, transaction has {} outputs",
                request.output_index,
                transaction.outputs.len()
            )));
        }
        let included = fold_merkle_proof(&transaction.txid, &request.merkle_proof)
            == header.merkle_root;
        debug!(
            "Transaction {} in block {}: included = {}",
            transaction.txid, block_hash, included
        );

        Ok(TransactionProof {
            transaction,
            output_index: request.output_index,
            block_hash,
            block_number: anchor.anchor_block_number + chunk.start_block_number_delta as u64,
            anchor_index: chunk.anchor_index,
            confirmations,
            included,
        })
    }
}
