//! Anchor relayer that proves each completed difficulty epoch and commits the next anchor.

use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use anchorage_bitcoin_client::{BitcoinClient, BitcoinDataSource};
use anchorage_prover::codec::HEADER_SIZE;
use anchorage_prover::{
    AnchorBlock, AnchorBlockRequest, AnchorUpdated, BlockChunkRequest, FullComputationsProof,
    ProverError, ProvingRequest,
};

use crate::proving::ProofBuilder;

/// Waits for each epoch to complete and advances the committed anchor over it
pub struct Relayer {
    config: RelayerConfig,
    builder: ProofBuilder,
    rx_shutdown: broadcast::Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Bitcoin RPC URL
    pub rpc_url: String,
    /// Bitcoin RPC user:password (optional)
    pub rpc_userpwd: Option<String>,
    /// Blocks to stay behind the tip
    pub block_lag: u64,
    pub retarget_period: u32,
    /// Delay before retrying after an advisory rejection
    pub retry_interval: Duration,
}

impl Relayer {
    pub fn new(
        config: RelayerConfig,
        builder: ProofBuilder,
        rx_shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            builder,
            rx_shutdown,
        }
    }

    async fn run_inner(&mut self) -> Result<(), anyhow::Error> {
        info!("Anchor relayer started");

        let mut bitcoin_client =
            BitcoinClient::new(self.config.rpc_url.clone(), self.config.rpc_userpwd.clone())?;
        info!("Bitcoin RPC client initialized");

        self.relay(&mut bitcoin_client).await
    }

    /// Advance the anchor epoch after epoch until shutdown
    pub async fn relay(&mut self, source: &mut dyn BitcoinDataSource) -> Result<(), anyhow::Error> {
        let period = self.config.retarget_period as u64;
        loop {
            let app_client = self.builder.app_client();
            let (anchor_index, anchor) = app_client.get_last_anchor().await?;
            // Headers proven on top of the new anchor, the prover may change it at runtime
            let min_confirmations = app_client.get_min_confirmations().await? as u64;
            if source
                .get_block_confirmations(&anchor.anchor_block_hash)
                .await?
                < 0
            {
                warn!(
                    "Anchor #{} {} is not on the node's active chain",
                    anchor_index, anchor.anchor_block_hash
                );
            }

            let last_needed = anchor.anchor_block_number + period + min_confirmations;
            info!(
                "Anchor #{} at block {}, waiting for block {}",
                anchor_index, anchor.anchor_block_number, last_needed
            );
            tokio::select! {
                res = source.wait_block_header(last_needed, self.config.block_lag) => {
                    res?;
                },
                _ = self.rx_shutdown.recv() => {
                    return Ok(())
                }
            }

            match self
                .advance(&*source, anchor_index, &anchor, min_confirmations)
                .await
            {
                Ok(event) => info!(
                    "Anchor #{} {} committed, superseding {}",
                    event.index, event.new_hash, event.previous_hash
                ),
                Err(err) if is_advisory(&err) => {
                    warn!("Anchor #{} not advanced yet: {}", anchor_index, err);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_interval) => {},
                        _ = self.rx_shutdown.recv() => {
                            return Ok(())
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Prove the epoch after `anchor` with its confirmations and commit the result
    async fn advance(
        &self,
        source: &dyn BitcoinDataSource,
        anchor_index: u64,
        anchor: &AnchorBlock,
        min_confirmations: u64,
    ) -> Result<AnchorUpdated, anyhow::Error> {
        let period = self.config.retarget_period as u64;
        let start = anchor.anchor_block_number + 1;
        let end = anchor.anchor_block_number + period + min_confirmations;
        let raw = source.get_raw_headers(start, end).await?;
        if raw.len() != (end - start + 1) as usize * HEADER_SIZE {
            bail!("Node returned {} bytes for headers {}..={}", raw.len(), start, end);
        }
        let (epoch_headers, confirmation_headers) = raw.split_at(period as usize * HEADER_SIZE);

        let chunks = self
            .builder
            .prove_headers(FullComputationsProof::empty(), epoch_headers, anchor_index)
            .await?;
        let last_chunk = chunks
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("Epoch produced no chunk proofs"))?;
        let rollup = self.builder.rollup(chunks).await?;

        // Confirmations must fit a single chunk
        let confirmations = self
            .builder
            .compute(ProvingRequest::BlockChunk(BlockChunkRequest {
                prev_proof: last_chunk,
                raw_headers: confirmation_headers.to_vec(),
                anchor_index,
            }))
            .await?;

        let anchor_proof = self
            .builder
            .compute(ProvingRequest::AnchorBlock(AnchorBlockRequest {
                epoch_rollup_proof: rollup,
                confirmations_proof: confirmations,
                epoch_start_header: epoch_headers[..HEADER_SIZE].to_vec(),
                epoch_end_header: epoch_headers[epoch_headers.len() - HEADER_SIZE..].to_vec(),
            }))
            .await?;
        self.builder.app_client().ack_anchor_block(anchor_proof).await
    }

    pub async fn run(&mut self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("Anchor relayer exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("Anchor relayer terminated");
                Ok(())
            }
        }
    }
}

fn is_advisory(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ProverError>()
        .is_some_and(ProverError::is_advisory)
}
