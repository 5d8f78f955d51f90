//! Raw block header decoding and canonical block hashing.

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::BlockHash;

use crate::error::{ProverError, Result};

/// Serialized size of a Bitcoin block header
pub const HEADER_SIZE: usize = 80;

/// Decode a concatenation of 80-byte headers, preserving input order.
pub fn decode_headers(raw: &[u8]) -> Result<Vec<BlockHeader>> {
    if raw.is_empty() || raw.len() % HEADER_SIZE != 0 {
        return Err(ProverError::MalformedInput(format!(
            "Invalid blockheaders size: {} bytes",
            raw.len()
        )));
    }
    raw.chunks_exact(HEADER_SIZE).map(decode_header).collect()
}

/// Decode exactly one 80-byte header.
pub fn decode_header(raw: &[u8]) -> Result<BlockHeader> {
    if raw.len() != HEADER_SIZE {
        return Err(ProverError::MalformedInput(format!(
            "Invalid blockheader size: {} bytes",
            raw.len()
        )));
    }
    Ok(deserialize(raw)?)
}

/// Serialize headers back into their concatenated wire form.
pub fn encode_headers<'a>(headers: impl IntoIterator<Item = &'a BlockHeader>) -> Vec<u8> {
    headers.into_iter().flat_map(serialize).collect()
}

/// Double SHA-256 of the serialized header.
pub fn header_hash(header: &BlockHeader) -> BlockHash {
    header.block_hash()
}
