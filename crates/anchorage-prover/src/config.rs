use bitcoin::Network;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::chain::MAX_CHUNK_SIZE;
use crate::difficulty::ChainParams;
use crate::error::{ProverError, Result};

/// Default depth a block must be buried under before it is accepted
pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 6;

/// A transaction's block and its confirmations travel in a single chunk
pub const MAX_MIN_CONFIRMATIONS: u32 = MAX_CHUNK_SIZE as u32 - 1;

/// At least one confirmation, at most what one chunk can carry.
pub fn check_min_confirmations(min_confirmations: u32) -> Result<()> {
    if min_confirmations == 0 || min_confirmations > MAX_MIN_CONFIRMATIONS {
        return Err(ProverError::MalformedInput(format!(
            "min confirmations must be within 1..={MAX_MIN_CONFIRMATIONS}, got {min_confirmations}"
        )));
    }
    Ok(())
}

/// Trust and consensus configuration of a prover instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProverConfig {
    /// Only affects how output addresses are rendered
    pub network: Network,
    /// Key of the attested computation unit
    pub attested_signer: PublicKey,
    #[serde(default)]
    pub witnesses: Vec<PublicKey>,
    /// Zero trusts the attested signer alone
    #[serde(default)]
    pub min_witness: usize,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    pub chain_params: ChainParams,
}

fn default_min_confirmations() -> u32 {
    DEFAULT_MIN_CONFIRMATIONS
}

impl ProverConfig {
    pub fn new(network: Network, attested_signer: PublicKey) -> Self {
        Self {
            network,
            attested_signer,
            witnesses: vec![],
            min_witness: 0,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            chain_params: ChainParams::for_network(network),
        }
    }
}
