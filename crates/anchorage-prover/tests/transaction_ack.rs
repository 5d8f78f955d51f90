use anchorage_prover::attestation::FixedKeySigner;
use anchorage_prover::test_utils::{regtest_params, sample_transaction, TestChain};
use anchorage_prover::{
    build_merkle_proof, BitcoinProver, BlockChunkRequest, ComputationSigner, DepositCollector,
    FullComputationsProof, ProverConfig, ProverError, ProverEvent, ProvingAction, ProvingRequest,
    TransactionAcknowledged, TransactionRequest,
};
use bitcoin::consensus::serialize;
use bitcoin::{Amount, Network, Transaction, Txid};

const TX_BLOCK: usize = 11;

struct Setup {
    chain: TestChain,
    transactions: Vec<Transaction>,
    prover: BitcoinProver<FixedKeySigner>,
    /// Chunk covering heights 1..TX_BLOCK
    lead: FullComputationsProof,
}

fn setup(confirmations: usize) -> Setup {
    let mut chain = TestChain::default();
    chain.extend(TX_BLOCK - 1);
    let transactions: Vec<Transaction> = (0..5).map(|i| sample_transaction(i, i % 2 == 0)).collect();
    chain.push_block_with_transactions(&transactions);
    chain.extend(confirmations);

    let signer = FixedKeySigner::from_seed(1);
    let mut config = ProverConfig::new(Network::Regtest, signer.public_key());
    config.chain_params = regtest_params();
    let prover = BitcoinProver::new(config, chain.anchor(), signer).unwrap();

    let lead = prover
        .compute_request(&ProvingRequest::BlockChunk(BlockChunkRequest {
            prev_proof: FullComputationsProof::empty(),
            raw_headers: chain.raw_range(1..=TX_BLOCK - 1),
            anchor_index: 0,
        }))
        .unwrap();
    Setup {
        chain,
        transactions,
        prover,
        lead,
    }
}

impl Setup {
    fn confirmations_chunk(&self) -> FullComputationsProof {
        self.prover
            .compute_request(&ProvingRequest::BlockChunk(BlockChunkRequest {
                prev_proof: self.lead.clone(),
                raw_headers: self.chain.raw_range(TX_BLOCK..=self.chain.tip_height()),
                anchor_index: 0,
            }))
            .unwrap()
    }

    fn request(&self, tx_index: usize, output_index: u32) -> TransactionRequest {
        let txids: Vec<Txid> = self.transactions.iter().map(Transaction::compute_txid).collect();
        TransactionRequest {
            raw_transaction: serialize(&self.transactions[tx_index]),
            merkle_proof: build_merkle_proof(&txids, tx_index).unwrap(),
            output_index,
            raw_block_header: self.chain.raw(TX_BLOCK),
            chunk_proof: self.confirmations_chunk(),
        }
    }
}

#[test]
fn test_transaction_acknowledged_exactly_once() {
    let mut setup = setup(6);
    let request = ProvingRequest::Transaction(setup.request(2, 0));
    let proof = setup
        .prover
        .compute(ProvingAction::Transaction, &request.encode_payload().unwrap())
        .unwrap();

    let tx_proof = proof.transaction().unwrap();
    assert!(tx_proof.included);
    assert_eq!(tx_proof.block_number, TX_BLOCK as u64);
    assert_eq!(tx_proof.block_hash, setup.chain.hash(TX_BLOCK));
    assert_eq!(tx_proof.confirmations, 6);
    assert_eq!(tx_proof.anchor_index, 0);
    let txid = setup.transactions[2].compute_txid();
    assert_eq!(tx_proof.tx_hash(), txid);

    let mut collector = DepositCollector::new(Network::Regtest);
    let event = setup
        .prover
        .ack_transaction(&proof, &mut collector, b"memo")
        .unwrap();
    assert_eq!(
        event,
        TransactionAcknowledged {
            tx_hash: txid,
            use_tag: 0
        }
    );
    assert!(setup.prover.is_acknowledged(txid, 0));
    assert!(!setup.prover.is_acknowledged(txid, 1));
    assert_eq!(collector.deposits().len(), 1);
    assert_eq!(collector.deposits()[0].value, Amount::from_sat(50_002));
    assert!(collector.deposits()[0]
        .address
        .as_deref()
        .unwrap()
        .starts_with("bcrt1q"));

    assert_eq!(
        setup.prover.ack_transaction(&proof, &mut collector, b"memo"),
        Err(ProverError::AlreadyAcknowledged {
            tx_hash: txid,
            use_tag: 0
        })
    );
    assert_eq!(collector.deposits().len(), 1);
    assert_eq!(
        setup.prover.drain_events(),
        vec![ProverEvent::TransactionAcknowledged(event)]
    );
}

#[test]
fn test_wrong_branch_is_not_included() {
    let mut setup = setup(6);
    let mut request = setup.request(1, 0);
    request.merkle_proof[0].is_left = !request.merkle_proof[0].is_left;
    let proof = setup
        .prover
        .compute_request(&ProvingRequest::Transaction(request))
        .unwrap();
    assert!(!proof.transaction().unwrap().included);

    let mut collector = DepositCollector::new(Network::Regtest);
    assert_eq!(
        setup.prover.ack_transaction(&proof, &mut collector, &[]),
        Err(ProverError::NotIncluded(setup.transactions[1].compute_txid()))
    );
    assert!(collector.deposits().is_empty());
}

#[test]
fn test_transaction_needs_buried_block() {
    let setup = setup(3);
    let err = setup
        .prover
        .compute_request(&ProvingRequest::Transaction(setup.request(0, 0)))
        .unwrap_err();
    assert_eq!(
        err,
        ProverError::TooFewConfirmations {
            required: 6,
            found: 3
        }
    );
    assert!(err.is_advisory());
}

#[test]
fn test_transaction_request_must_match_chunk() {
    let setup = setup(6);

    let mut other_header = setup.request(0, 0);
    other_header.raw_block_header = setup.chain.raw(TX_BLOCK - 1);
    assert!(matches!(
        setup
            .prover
            .compute_request(&ProvingRequest::Transaction(other_header)),
        Err(ProverError::InvalidSequence(_))
    ));

    assert!(matches!(
        setup
            .prover
            .compute_request(&ProvingRequest::Transaction(setup.request(0, 2))),
        Err(ProverError::MalformedInput(_))
    ));

    let mut forged = setup.request(0, 0);
    forged.chunk_proof.partial_proof.computations_result[0] ^= 0x01;
    assert_eq!(
        setup
            .prover
            .compute_request(&ProvingRequest::Transaction(forged)),
        Err(ProverError::SignatureInvalid)
    );
}
