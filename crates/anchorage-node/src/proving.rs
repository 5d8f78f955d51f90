//! Builds chained proofs through the app server and co-signs them with local witness keys.

use std::sync::Arc;

use anyhow::bail;
use tracing::debug;

use anchorage_prover::codec::HEADER_SIZE;
use anchorage_prover::{
    split_into_chunks, BlockChunkRequest, BlockChunkRollupRequest, FullComputationsProof,
    ProvingRequest, WitnessKey,
};

use crate::app::AppClient;

#[derive(Clone)]
pub struct ProofBuilder {
    app_client: AppClient,
    witnesses: Arc<Vec<WitnessKey>>,
    chunk_size: usize,
}

impl ProofBuilder {
    pub fn new(
        app_client: AppClient,
        witnesses: Vec<WitnessKey>,
        chunk_size: usize,
    ) -> Result<Self, anyhow::Error> {
        // Rejects sizes a chunk proof cannot carry before any work is done
        split_into_chunks::<u8>(&[], chunk_size)?;
        Ok(Self {
            app_client,
            witnesses: Arc::new(witnesses),
            chunk_size,
        })
    }

    pub fn app_client(&self) -> &AppClient {
        &self.app_client
    }

    /// Sign a request with the computation unit, then add every witness signature.
    pub async fn compute(
        &self,
        request: ProvingRequest,
    ) -> Result<FullComputationsProof, anyhow::Error> {
        let mut proof = self.app_client.compute(request).await?;
        for witness in self.witnesses.iter() {
            witness.cosign(&mut proof);
        }
        Ok(proof)
    }

    /// Prove concatenated headers as linked chunks continuing from `prev_proof`.
    pub async fn prove_headers(
        &self,
        prev_proof: FullComputationsProof,
        raw_headers: &[u8],
        anchor_index: u64,
    ) -> Result<Vec<FullComputationsProof>, anyhow::Error> {
        if raw_headers.len() % HEADER_SIZE != 0 {
            bail!(
                "Header batch of {} bytes is not a multiple of {}",
                raw_headers.len(),
                HEADER_SIZE
            );
        }
        let headers: Vec<&[u8]> = raw_headers.chunks(HEADER_SIZE).collect();

        let mut prev_proof = prev_proof;
        let mut proofs = Vec::new();
        for chunk in split_into_chunks(&headers, self.chunk_size)? {
            let proof = self
                .compute(ProvingRequest::BlockChunk(BlockChunkRequest {
                    prev_proof,
                    raw_headers: chunk.concat(),
                    anchor_index,
                }))
                .await?;
            proofs.push(proof.clone());
            prev_proof = proof;
        }
        debug!(
            "Proved {} headers in {} chunks relative to anchor #{}",
            headers.len(),
            proofs.len(),
            anchor_index
        );
        Ok(proofs)
    }

    pub async fn rollup(
        &self,
        proofs: Vec<FullComputationsProof>,
    ) -> Result<FullComputationsProof, anyhow::Error> {
        self.compute(ProvingRequest::BlockChunkRollup(BlockChunkRollupRequest {
            proofs,
        }))
        .await
    }
}
