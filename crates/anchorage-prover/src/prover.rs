//! Prover facade: attested computation entry point and acknowledgment state.

use bitcoin::{Network, Txid};
use secp256k1::PublicKey;
use tracing::{debug, info};

use crate::ack::{AckKey, AckTable, TransactionConsumer};
use crate::attestation::{AttestationVerifier, ComputationSigner};
use crate::chain::ProofChainEngine;
use crate::config::{check_min_confirmations, ProverConfig};
use crate::difficulty::ChainParams;
use crate::error::{ProverError, Result};
use crate::events::{AnchorUpdated, ProverEvent, TransactionAcknowledged};
use crate::ledger::{AnchorLedger, PendingCommit};
use crate::proof::{
    AnchorBlock, BlockChunkProof, ComputationsResult, FullComputationsProof,
    PartialComputationsProof, ProvingAction, ProvingRequest,
};

/// Computation unit plus verifier-side state, all operations are all-or-nothing.
pub struct BitcoinProver<S> {
    network: Network,
    params: ChainParams,
    min_confirmations: u32,
    verifier: AttestationVerifier,
    ledger: AnchorLedger,
    acks: AckTable,
    signer: S,
    events: Vec<ProverEvent>,
}

impl<S: ComputationSigner> BitcoinProver<S> {
    /// Fresh prover trusting `seed` as anchor #0.
    pub fn new(config: ProverConfig, seed: AnchorBlock, signer: S) -> Result<Self> {
        let ledger = AnchorLedger::bootstrap(seed, &config.chain_params)?;
        Self::with_state(config, ledger, AckTable::default(), signer)
    }

    /// Prover resumed from persisted anchors and acknowledgments.
    pub fn restore(
        config: ProverConfig,
        anchors: Vec<AnchorBlock>,
        acknowledged: impl IntoIterator<Item = AckKey>,
        signer: S,
    ) -> Result<Self> {
        let ledger = AnchorLedger::restore(anchors, &config.chain_params)?;
        Self::with_state(config, ledger, AckTable::restore(acknowledged), signer)
    }

    fn with_state(
        config: ProverConfig,
        ledger: AnchorLedger,
        acks: AckTable,
        signer: S,
    ) -> Result<Self> {
        if signer.public_key() != config.attested_signer {
            return Err(ProverError::MalformedInput(format!(
                "signer key {} does not match configured attested signer {}",
                signer.public_key(),
                config.attested_signer
            )));
        }
        check_min_confirmations(config.min_confirmations)?;
        let verifier =
            AttestationVerifier::new(config.attested_signer, config.witnesses, config.min_witness)?;
        info!(
            "Prover ready on {} at anchor #{} (height {})",
            config.network,
            ledger.current_index(),
            ledger.current().anchor_block_number
        );
        Ok(Self {
            network: config.network,
            params: config.chain_params,
            min_confirmations: config.min_confirmations,
            verifier,
            ledger,
            acks,
            signer,
            events: vec![],
        })
    }

    pub fn engine(&self) -> ProofChainEngine<'_> {
        ProofChainEngine::new(
            &self.params,
            &self.verifier,
            &self.ledger,
            self.min_confirmations,
        )
    }

    /// Run `action` over its bincode encoded request and sign the result.
    pub fn compute(&self, action: ProvingAction, payload: &[u8]) -> Result<FullComputationsProof> {
        let request = ProvingRequest::decode_payload(action, payload)?;
        self.compute_request(&request)
    }

    pub fn compute_request(&self, request: &ProvingRequest) -> Result<FullComputationsProof> {
        let engine = self.engine();
        let result = match request {
            ProvingRequest::BlockChunk(req) => ComputationsResult::BlockChunk(engine.prove_chunk(
                &req.prev_proof,
                &req.raw_headers,
                req.anchor_index,
            )?),
            ProvingRequest::Transaction(req) => {
                ComputationsResult::Transaction(engine.prove_transaction(req)?)
            }
            ProvingRequest::AnchorBlock(req) => {
                ComputationsResult::AnchorBlock(engine.prove_anchor(req)?)
            }
            ProvingRequest::BlockChunkRollup(req) => {
                ComputationsResult::BlockChunkRollup(engine.merge_rollup(&req.proofs)?)
            }
        };
        let computations_result = result.encode()?;
        let contract_signature = self.signer.sign(&computations_result)?;
        debug!("Computed {:?} result", request.action());
        Ok(FullComputationsProof {
            partial_proof: PartialComputationsProof {
                computations_result,
                contract_signature,
            },
            witness_signatures: vec![],
        })
    }

    /// Read-only chunk validation without signing.
    pub fn prove_block_chunk(
        &self,
        prev_proof: &FullComputationsProof,
        raw_headers: &[u8],
        anchor_index: u64,
    ) -> Result<BlockChunkProof> {
        self.engine()
            .prove_chunk(prev_proof, raw_headers, anchor_index)
    }

    pub fn stage_anchor_block(&self, proof: &FullComputationsProof) -> Result<PendingCommit> {
        self.ledger.stage(&self.verifier, proof)
    }

    pub fn apply_anchor_block(&mut self, pending: PendingCommit) -> Result<AnchorUpdated> {
        let event = self.ledger.apply(pending)?;
        self.events.push(event.clone().into());
        Ok(event)
    }

    pub fn ack_anchor_block(&mut self, proof: &FullComputationsProof) -> Result<AnchorUpdated> {
        let pending = self.stage_anchor_block(proof)?;
        self.apply_anchor_block(pending)
    }

    pub fn ack_transaction(
        &mut self,
        proof: &FullComputationsProof,
        consumer: &mut dyn TransactionConsumer,
        aux_data: &[u8],
    ) -> Result<TransactionAcknowledged> {
        let event = self.acks.acknowledge(
            &self.verifier,
            &self.ledger,
            self.min_confirmations,
            proof,
            consumer,
            aux_data,
        )?;
        self.events.push(event.clone().into());
        Ok(event)
    }

    pub fn is_acknowledged(&self, tx_hash: Txid, use_tag: u32) -> bool {
        self.acks.contains(&AckKey { tx_hash, use_tag })
    }

    pub fn last_anchor(&self) -> &AnchorBlock {
        self.ledger.current()
    }

    pub fn last_anchor_index(&self) -> u64 {
        self.ledger.current_index()
    }

    pub fn anchor(&self, index: u64) -> Option<&AnchorBlock> {
        self.ledger.anchor(index)
    }

    pub fn ledger(&self) -> &AnchorLedger {
        &self.ledger
    }

    pub fn verifier(&self) -> &AttestationVerifier {
        &self.verifier
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn chain_params(&self) -> &ChainParams {
        &self.params
    }

    pub fn signer_public_key(&self) -> PublicKey {
        self.signer.public_key()
    }

    pub fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    pub fn set_min_confirmations(&mut self, min_confirmations: u32) -> Result<()> {
        check_min_confirmations(min_confirmations)?;
        self.min_confirmations = min_confirmations;
        info!("Minimum confirmations set to {}", min_confirmations);
        Ok(())
    }

    pub fn set_witnesses(&mut self, witnesses: impl IntoIterator<Item = PublicKey>) -> Result<()> {
        self.verifier.set_witnesses(witnesses)?;
        info!("Witness set updated: {} keys", self.verifier.witnesses().len());
        Ok(())
    }

    pub fn set_min_witness(&mut self, min_witness: usize) -> Result<()> {
        self.verifier.set_min_witness(min_witness)?;
        info!("Minimum witness count set to {}", min_witness);
        Ok(())
    }

    /// Take queued events in emission order.
    pub fn drain_events(&mut self) -> Vec<ProverEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::FixedKeySigner;
    use crate::proof::BlockChunkRequest;
    use crate::test_utils::{regtest_params, TestChain};

    fn prover(chain: &TestChain) -> BitcoinProver<FixedKeySigner> {
        let signer = FixedKeySigner::from_seed(1);
        let mut config = ProverConfig::new(Network::Regtest, signer.public_key());
        config.chain_params = regtest_params();
        BitcoinProver::new(config, chain.anchor(), signer).unwrap()
    }

    #[test]
    fn test_signer_must_match_config() {
        let chain = TestChain::default();
        let config = ProverConfig::new(Network::Regtest, FixedKeySigner::from_seed(2).public_key());
        assert!(matches!(
            BitcoinProver::new(config, chain.anchor(), FixedKeySigner::from_seed(1)),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_zero_confirmations_rejected() {
        let chain = TestChain::default();
        let signer = FixedKeySigner::from_seed(1);
        let mut config = ProverConfig::new(Network::Regtest, signer.public_key());
        config.min_confirmations = 0;
        assert!(matches!(
            BitcoinProver::new(config, chain.anchor(), signer),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_compute_by_tag_matches_typed_request() {
        let chain = TestChain::mine(5);
        let prover = prover(&chain);
        let request = ProvingRequest::BlockChunk(BlockChunkRequest {
            prev_proof: FullComputationsProof::empty(),
            raw_headers: chain.raw_range(1..=5),
            anchor_index: 0,
        });

        let by_tag = prover
            .compute(
                ProvingAction::try_from(0).unwrap(),
                &request.encode_payload().unwrap(),
            )
            .unwrap();
        let typed = prover.compute_request(&request).unwrap();
        assert_eq!(by_tag, typed);
        prover.verifier().verify(&by_tag).unwrap();

        let chunk = by_tag.block_chunk().unwrap();
        assert_eq!(
            chunk,
            prover
                .prove_block_chunk(&FullComputationsProof::empty(), &chain.raw_range(1..=5), 0)
                .unwrap()
        );
    }

    #[test]
    fn test_compute_rejects_mismatched_payload() {
        let chain = TestChain::mine(2);
        let prover = prover(&chain);
        assert!(matches!(
            prover.compute(ProvingAction::AnchorBlock, &[1, 2, 3]),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_admin_setters() {
        let chain = TestChain::default();
        let mut prover = prover(&chain);
        prover.set_min_confirmations(3).unwrap();
        assert_eq!(prover.min_confirmations(), 3);
        assert!(matches!(
            prover.set_min_confirmations(0),
            Err(ProverError::MalformedInput(_))
        ));
        assert_eq!(prover.min_confirmations(), 3);
        assert!(prover.set_min_witness(1).is_err());
        let witness = FixedKeySigner::from_seed(7).public_key();
        prover.set_witnesses(vec![witness]).unwrap();
        prover.set_min_witness(1).unwrap();
        assert_eq!(prover.verifier().min_witness(), 1);
        assert!(prover.drain_events().is_empty());
    }
}
