//! Prover restoration from the store, or bootstrap from a seed block fetched over RPC.

use anyhow::{anyhow, bail};
use tracing::{info, warn};

use anchorage_bitcoin_client::BitcoinDataSource;
use anchorage_prover::codec::{decode_header, header_hash};
use anchorage_prover::difficulty::target_from_bits;
use anchorage_prover::{AnchorBlock, BitcoinProver, ChainParams, ComputationSigner, ProverConfig};

use crate::store::LedgerStore;

/// Build the trusted anchor #0 from the epoch-boundary block at `height`.
///
/// The previous target is read from the first block of the preceding epoch,
/// the genesis block reuses its own target.
pub async fn seed_anchor(
    source: &dyn BitcoinDataSource,
    height: u64,
    params: &ChainParams,
) -> Result<AnchorBlock, anyhow::Error> {
    if !params.is_epoch_boundary(height) {
        bail!(
            "Seed height {} is not a multiple of the retarget period {}",
            height,
            params.retarget_period
        );
    }

    let hash = source.get_block_hash(height).await?;
    let header = decode_header(&source.get_raw_block_header(&hash).await?)?;
    if header_hash(&header) != hash {
        bail!("Header served for block {} hashes to {}", hash, header_hash(&header));
    }

    let previous_bits = match height.checked_sub(params.retarget_period as u64) {
        Some(previous_height) => {
            let previous_hash = source.get_block_hash(previous_height).await?;
            decode_header(&source.get_raw_block_header(&previous_hash).await?)?
                .bits
                .to_consensus()
        }
        None => header.bits.to_consensus(),
    };

    Ok(AnchorBlock {
        current_difficulty_target: target_from_bits(header.bits.to_consensus())?,
        previous_difficulty_target: target_from_bits(previous_bits)?,
        anchor_block_number: height,
        anchor_block_hash: hash,
        anchor_block_timestamp: header.time,
    })
}

/// Restore the prover from persisted anchors and acknowledgments, bootstrapping
/// anchor #0 when the store is empty.
pub async fn load_prover<S: ComputationSigner>(
    store: &dyn LedgerStore,
    source: &dyn BitcoinDataSource,
    config: ProverConfig,
    seed_height: u64,
    signer: S,
) -> Result<BitcoinProver<S>, anyhow::Error> {
    let anchors = store.get_anchors().await?;
    if anchors.is_empty() {
        info!("Empty ledger, bootstrapping from seed block #{}", seed_height);
        let seed = seed_anchor(source, seed_height, &config.chain_params).await?;
        let prover = BitcoinProver::new(config, seed.clone(), signer)?;
        store.add_anchor(0, &seed).await?;
        info!("Seed anchor {} persisted", seed.anchor_block_hash);
        return Ok(prover);
    }

    let seed = anchors
        .first()
        .ok_or_else(|| anyhow!("Ledger has no seed anchor"))?;
    if seed.anchor_block_number != seed_height {
        warn!(
            "Stored seed anchor is at height {}, ignoring configured seed height {}",
            seed.anchor_block_number, seed_height
        );
    }
    let acknowledgements = store.get_acknowledgements().await?;
    info!(
        "Restoring {} anchors and {} acknowledgements",
        anchors.len(),
        acknowledgements.len()
    );
    Ok(BitcoinProver::restore(
        config,
        anchors,
        acknowledgements,
        signer,
    )?)
}
