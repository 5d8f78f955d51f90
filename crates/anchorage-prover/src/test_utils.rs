//! Mined regtest-difficulty header chains, signers and sample transactions for tests.

use std::ops::RangeInclusive;

use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::consensus::serialize;
use bitcoin::constants::genesis_block;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::merkle_tree::calculate_root;
use bitcoin::transaction::{self, TxIn, TxOut};
use bitcoin::{
    absolute, Amount, BlockHash, CompactTarget, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxMerkleNode, Txid, WPubkeyHash, Witness,
};

use crate::attestation::{AttestationVerifier, ComputationSigner, FixedKeySigner};
use crate::chain::{split_into_chunks, ProofChainEngine};
use crate::codec::header_hash;
use crate::difficulty::{bits_from_target, meets_target, retarget, target_from_bits, ChainParams};
use crate::ledger::AnchorLedger;
use crate::proof::{
    AnchorBlock, ComputationsResult, FullComputationsProof, PartialComputationsProof,
};

/// Regtest proof-of-work limit with mainnet retargeting rules.
pub fn regtest_params() -> ChainParams {
    ChainParams {
        no_retargeting: false,
        ..ChainParams::for_network(Network::Regtest)
    }
}

/// Encode and sign a result the way the computation unit does.
pub fn sign_result(
    signer: &impl ComputationSigner,
    result: ComputationsResult,
) -> FullComputationsProof {
    let computations_result = result.encode().expect("result encodes");
    let contract_signature = signer.sign(&computations_result).expect("signer works");
    FullComputationsProof {
        partial_proof: PartialComputationsProof {
            computations_result,
            contract_signature,
        },
        witness_signatures: vec![],
    }
}

/// One-input, two-output transaction; `segwit` adds a witness without changing the txid.
pub fn sample_transaction(seed: u8, segwit: bool) -> Transaction {
    let witness = if segwit {
        Witness::from_slice(&[vec![seed; 72], vec![0x02; 33]])
    } else {
        Witness::new()
    };
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([seed; 32]),
                vout: seed as u32,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xfffffffd),
            witness,
        }],
        output: vec![
            TxOut {
                value: Amount::from_sat(50_000 + seed as u64),
                script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([seed; 20])),
            },
            TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a, 0x01, seed]),
            },
        ],
    }
}

/// Header chain starting at the regtest genesis, mined on the fly.
#[derive(Debug, Clone)]
pub struct TestChain {
    params: ChainParams,
    headers: Vec<BlockHeader>,
    block_spacing: u32,
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new(regtest_params())
    }
}

impl TestChain {
    pub fn new(params: ChainParams) -> Self {
        Self {
            params,
            headers: vec![genesis_block(Network::Regtest).header],
            block_spacing: 600,
        }
    }

    /// Genesis plus `count` mined blocks
    pub fn mine(count: usize) -> Self {
        let mut chain = Self::default();
        chain.extend(count);
        chain
    }

    /// Seconds between consecutive block timestamps from now on
    pub fn with_block_spacing(mut self, block_spacing: u32) -> Self {
        self.block_spacing = block_spacing;
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn extend(&mut self, count: usize) {
        for _ in 0..count {
            let height = self.headers.len() as u64;
            let merkle_root = TxMerkleNode::from_byte_array(
                sha256d::Hash::hash(&height.to_le_bytes()).to_byte_array(),
            );
            self.push_block(merkle_root);
        }
    }

    pub fn push_block_with_transactions(&mut self, transactions: &[Transaction]) {
        let root = calculate_root(transactions.iter().map(Transaction::compute_txid))
            .expect("at least one transaction");
        self.push_block(TxMerkleNode::from_byte_array(root.to_byte_array()));
    }

    pub fn push_block(&mut self, merkle_root: TxMerkleNode) {
        let height = self.headers.len();
        let last = self.headers[height - 1];
        let bits = self.next_bits(height);
        let target = target_from_bits(bits).expect("valid bits");
        let mut header = BlockHeader {
            version: Version::from_consensus(0x2000_0000),
            prev_blockhash: last.block_hash(),
            merkle_root,
            time: last.time + self.block_spacing,
            bits: CompactTarget::from_consensus(bits),
            nonce: 0,
        };
        while !meets_target(&header.block_hash(), &target) {
            header.nonce += 1;
        }
        self.headers.push(header);
    }

    fn next_bits(&self, height: usize) -> u32 {
        let last = &self.headers[height - 1];
        if self.params.no_retargeting || !self.params.is_epoch_boundary(height as u64) {
            return last.bits.to_consensus();
        }
        let first = &self.headers[height - self.params.retarget_period as usize];
        let current = target_from_bits(last.bits.to_consensus()).expect("valid bits");
        let next = retarget(
            &current,
            last.time as i64 - first.time as i64,
            &self.params,
        );
        bits_from_target(&next)
    }

    pub fn tip_height(&self) -> usize {
        self.headers.len() - 1
    }

    pub fn header(&self, height: usize) -> &BlockHeader {
        &self.headers[height]
    }

    pub fn hash(&self, height: usize) -> BlockHash {
        header_hash(&self.headers[height])
    }

    pub fn raw(&self, height: usize) -> Vec<u8> {
        serialize(&self.headers[height])
    }

    pub fn raw_range(&self, heights: RangeInclusive<usize>) -> Vec<u8> {
        heights.flat_map(|height| self.raw(height)).collect()
    }

    /// Anchor record for an epoch-boundary block of this chain
    pub fn anchor_at(&self, height: usize) -> AnchorBlock {
        let header = &self.headers[height];
        let previous = &self.headers[height.saturating_sub(1)];
        AnchorBlock {
            current_difficulty_target: target_from_bits(header.bits.to_consensus())
                .expect("valid bits"),
            previous_difficulty_target: target_from_bits(previous.bits.to_consensus())
                .expect("valid bits"),
            anchor_block_number: height as u64,
            anchor_block_hash: header_hash(header),
            anchor_block_timestamp: header.time,
        }
    }

    pub fn anchor(&self) -> AnchorBlock {
        self.anchor_at(0)
    }

    /// Engine fixture seeded with this chain's genesis anchor
    pub fn fixture(&self) -> Fixture {
        let signer = FixedKeySigner::from_seed(1);
        let verifier =
            AttestationVerifier::new(signer.public_key(), vec![], 0).expect("empty witness set");
        let ledger = AnchorLedger::bootstrap(self.anchor(), &self.params).expect("valid seed");
        Fixture {
            params: self.params,
            signer,
            verifier,
            ledger,
            min_confirmations: 6,
        }
    }
}

/// Owned state a [`ProofChainEngine`] borrows from.
pub struct Fixture {
    pub params: ChainParams,
    pub signer: FixedKeySigner,
    pub verifier: AttestationVerifier,
    pub ledger: AnchorLedger,
    pub min_confirmations: u32,
}

impl Fixture {
    pub fn engine(&self) -> ProofChainEngine<'_> {
        ProofChainEngine::new(
            &self.params,
            &self.verifier,
            &self.ledger,
            self.min_confirmations,
        )
    }

    /// Signed chunk proofs covering `heights`, starting right after the current anchor.
    pub fn prove_chunks(
        &self,
        chain: &TestChain,
        heights: RangeInclusive<usize>,
        chunk_size: usize,
    ) -> Vec<FullComputationsProof> {
        let heights: Vec<usize> = heights.collect();
        let anchor_index = self.ledger.current_index();
        let engine = self.engine();
        let mut prev = FullComputationsProof::empty();
        let mut proofs = Vec::new();
        for chunk in split_into_chunks(&heights, chunk_size).expect("valid chunk size") {
            let raw = chain.raw_range(chunk[0]..=chunk[chunk.len() - 1]);
            let proof = engine
                .prove_chunk(&prev, &raw, anchor_index)
                .expect("valid chunk");
            let signed = sign_result(&self.signer, ComputationsResult::BlockChunk(proof));
            proofs.push(signed.clone());
            prev = signed;
        }
        proofs
    }
}
