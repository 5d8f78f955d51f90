//! Collects everything needed to prove one transaction output and runs the transaction action.

use std::sync::Arc;

use bitcoin::Txid;
use thiserror::Error;
use tracing::debug;

use anchorage_bitcoin_client::{BitcoinClientError, BitcoinDataSource};
use anchorage_prover::{
    build_merkle_proof, BlockChunkRequest, FullComputationsProof, ProvingRequest,
    TransactionRequest,
};

use crate::proving::ProofBuilder;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Transaction {0} is not confirmed")]
    Unconfirmed(Txid),
    #[error("Block {0} is not on the active chain")]
    Stale(bitcoin::BlockHash),
    #[error("No committed anchor below block {0}")]
    NotAnchored(u64),
    #[error("Block {height} needs {required} confirmations, chain tip is {tip}")]
    Immature { height: u64, required: u32, tip: u64 },
    #[error("Transaction {0} is missing from its block")]
    MissingFromBlock(Txid),
    #[error("Bitcoin node error: {0}")]
    Source(#[from] BitcoinClientError),
    #[error(transparent)]
    Prover(#[from] anyhow::Error),
}

/// Builds signed transaction proofs from node data
#[derive(Clone)]
pub struct ProofCollector {
    builder: ProofBuilder,
    source: Arc<dyn BitcoinDataSource>,
}

impl ProofCollector {
    pub fn new(builder: ProofBuilder, source: Arc<dyn BitcoinDataSource>) -> Self {
        Self { builder, source }
    }

    /// Prove that output `output_index` of `txid` is buried under the required confirmations
    pub async fn prove_transaction(
        &self,
        txid: Txid,
        output_index: u32,
    ) -> Result<FullComputationsProof, CollectorError> {
        let block_hash = self
            .source
            .get_transaction_block_hash(&txid)
            .await?
            .ok_or(CollectorError::Unconfirmed(txid))?;
        let block = self.source.get_block_info(&block_hash).await?;
        if block.confirmations < 0 {
            return Err(CollectorError::Stale(block_hash));
        }

        // The containing block and its confirmations travel in a single chunk
        let min_confirmations = self.builder.app_client().get_min_confirmations().await?;
        let tip = self.source.get_best_block_height().await?;
        let last = block.height + min_confirmations as u64;
        if tip < last {
            return Err(CollectorError::Immature {
                height: block.height,
                required: min_confirmations,
                tip,
            });
        }

        let (anchor_index, anchor) = self
            .builder
            .app_client()
            .get_anchor_below(block.height)
            .await?
            .ok_or(CollectorError::NotAnchored(block.height))?;

        let mut prev_proof = FullComputationsProof::empty();
        if block.height > anchor.anchor_block_number + 1 {
            let lead = self
                .source
                .get_raw_headers(anchor.anchor_block_number + 1, block.height - 1)
                .await?;
            let proofs = self
                .builder
                .prove_headers(prev_proof, &lead, anchor_index)
                .await?;
            prev_proof = proofs.last().cloned().unwrap_or_default();
        }
        let chunk_proof = self
            .builder
            .compute(ProvingRequest::BlockChunk(BlockChunkRequest {
                prev_proof,
                raw_headers: self.source.get_raw_headers(block.height, last).await?,
                anchor_index,
            }))
            .await?;

        let position = block
            .txids
            .iter()
            .position(|id| *id == txid)
            .ok_or(CollectorError::MissingFromBlock(txid))?;
        let merkle_proof = build_merkle_proof(&block.txids, position)
            .ok_or(CollectorError::MissingFromBlock(txid))?;
        debug!(
            "Transaction {} is #{} of {} in block {}",
            txid,
            position,
            block.txids.len(),
            block.height
        );

        let request = TransactionRequest {
            raw_transaction: self
                .source
                .get_raw_transaction(&txid, Some(block_hash))
                .await?,
            merkle_proof,
            output_index,
            raw_block_header: self.source.get_raw_block_header(&block_hash).await?,
            chunk_proof,
        };
        Ok(self
            .builder
            .compute(ProvingRequest::Transaction(request))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::spawn_app;
    use crate::fake_chain::FakeChain;
    use anchorage_prover::test_utils::{sample_transaction, TestChain};
    use anchorage_prover::ProverError;
    use bitcoin::{Amount, Transaction};

    struct Setup {
        source: FakeChain,
        transactions: Vec<Transaction>,
        tx_height: usize,
    }

    fn setup(lead: usize, confirmations: usize) -> Setup {
        let mut source = FakeChain::new(TestChain::mine(lead));
        let transactions: Vec<Transaction> =
            (0..3).map(|i| sample_transaction(i + 1, i == 1)).collect();
        let tx_height = source.push_transactions(transactions.clone());
        source.extend(confirmations);
        Setup {
            source,
            transactions,
            tx_height,
        }
    }

    #[tokio::test]
    async fn test_collected_proof_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup(7, 6);
        let (client, _store, _shutdown) = spawn_app(&dir, setup.source.chain()).await;
        let builder = ProofBuilder::new(client.clone(), vec![], 3).unwrap();
        let collector = ProofCollector::new(builder, Arc::new(setup.source.clone()));

        let txid = setup.transactions[1].compute_txid();
        let proof = collector.prove_transaction(txid, 0).await.unwrap();
        let tx_proof = proof.transaction().unwrap();
        assert!(tx_proof.included);
        assert_eq!(tx_proof.block_number, setup.tx_height as u64);
        assert_eq!(tx_proof.confirmations, 6);

        let (event, deposits) = client
            .ack_transaction(proof.clone(), b"memo".to_vec())
            .await
            .unwrap();
        assert_eq!(event.tx_hash, txid);
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].value, Amount::from_sat(50_002));
        assert_eq!(deposits[0].aux_data, b"memo".to_vec());

        let err = client
            .ack_transaction(proof, vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProverError>(),
            Some(ProverError::AlreadyAcknowledged { .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_next_to_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup(0, 6);
        let (client, _store, _shutdown) = spawn_app(&dir, setup.source.chain()).await;
        let builder = ProofBuilder::new(client, vec![], 100).unwrap();
        let collector = ProofCollector::new(builder, Arc::new(setup.source.clone()));

        let txid = setup.transactions[0].compute_txid();
        let tx_proof = collector
            .prove_transaction(txid, 1)
            .await
            .unwrap()
            .transaction()
            .unwrap();
        assert_eq!(tx_proof.block_number, 1);
        assert_eq!(tx_proof.output_index, 1);
    }

    #[tokio::test]
    async fn test_unprovable_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup(2, 3);
        let (client, _store, _shutdown) = spawn_app(&dir, setup.source.chain()).await;
        let builder = ProofBuilder::new(client.clone(), vec![], 100).unwrap();
        let collector = ProofCollector::new(builder, Arc::new(setup.source.clone()));

        let immature = collector
            .prove_transaction(setup.transactions[0].compute_txid(), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            immature,
            CollectorError::Immature {
                height: 3,
                required: 6,
                tip: 6
            }
        ));

        let unknown = sample_transaction(42, false).compute_txid();
        assert!(matches!(
            collector.prove_transaction(unknown, 0).await.unwrap_err(),
            CollectorError::Unconfirmed(txid) if txid == unknown
        ));
    }

    #[tokio::test]
    async fn test_follows_runtime_min_confirmations() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup(2, 3);
        let (client, _store, _shutdown) = spawn_app(&dir, setup.source.chain()).await;
        let builder = ProofBuilder::new(client.clone(), vec![], 100).unwrap();
        let collector = ProofCollector::new(builder, Arc::new(setup.source.clone()));
        let txid = setup.transactions[0].compute_txid();

        assert!(matches!(
            collector.prove_transaction(txid, 0).await.unwrap_err(),
            CollectorError::Immature { required: 6, .. }
        ));

        client.set_min_confirmations(3).await.unwrap();
        let proof = collector.prove_transaction(txid, 0).await.unwrap();
        assert_eq!(proof.transaction().unwrap().confirmations, 3);
        client.ack_transaction(proof, vec![]).await.unwrap();
    }
}
