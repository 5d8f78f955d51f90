//! Proof-of-work checks and difficulty retargeting arithmetic.

use bitcoin::block::Header as BlockHeader;
use bitcoin::params::Params;
use bitcoin::{BlockHash, CompactTarget, Network, Target};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::header_hash;
use crate::error::{ProverError, Result};
use crate::target::DifficultyTarget;

/// Number of blocks between difficulty adjustments
pub const RETARGET_PERIOD: u32 = 2016;

/// Expected duration of one retarget period in seconds (two weeks)
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Consensus constants the validator depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub retarget_period: u32,
    pub target_timespan: u32,
    /// Easiest target a header may ever claim
    pub pow_limit: DifficultyTarget,
    /// Regtest keeps the same target forever
    pub no_retargeting: bool,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        let params = Params::new(network);
        Self {
            retarget_period: RETARGET_PERIOD,
            target_timespan: TARGET_TIMESPAN,
            pow_limit: params.max_attainable_target.into(),
            no_retargeting: params.no_pow_retargeting,
        }
    }

    pub fn is_epoch_boundary(&self, block_number: u64) -> bool {
        block_number % self.retarget_period as u64 == 0
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::for_network(Network::Bitcoin)
    }
}

/// Expand compact `nBits` into a full 256-bit target.
///
/// Negative and overflowing encodings are rejected, everything else expands
/// the way `bitcoin::Target::from_compact` does.
pub fn target_from_bits(bits: u32) -> Result<DifficultyTarget> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        if word != 0 {
            return Err(ProverError::MalformedInput(format!(
                "negative compact target {bits:#010x}"
            )));
        }
        return Ok(DifficultyTarget::default());
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(ProverError::MalformedInput(format!(
            "compact target {bits:#010x} overflows 256 bits"
        )));
    }
    Ok(Target::from_compact(CompactTarget::from_consensus(bits)).into())
}

/// Compact encoding of a target, truncating to a 3-byte mantissa.
pub fn bits_from_target(target: &DifficultyTarget) -> u32 {
    Target::from(*target).to_compact_lossy().to_consensus()
}

pub fn meets_target(hash: &BlockHash, target: &DifficultyTarget) -> bool {
    Target::from(*target).is_met_by(*hash)
}

pub fn check_proof_of_work(header: &BlockHeader, target: &DifficultyTarget) -> Result<()> {
    let block_hash = header_hash(header);
    if meets_target(&block_hash, target) {
        Ok(())
    } else {
        Err(ProverError::InvalidBlockHash { block_hash })
    }
}

/// Next target after an epoch that took `timespan` seconds, rounded through
/// the compact encoding headers carry.
///
/// Matches `CompactTarget::from_next_work_required` but multiplies in arbitrary
/// precision, easy regtest targets times four timespans do not fit a `U256`.
pub fn retarget(
    last_target: &DifficultyTarget,
    timespan: i64,
    params: &ChainParams,
) -> DifficultyTarget {
    let expected = params.target_timespan as i64;
    let clamped = timespan.clamp(expected / 4, expected * 4) as u64;
    let last = BigUint::from_bytes_be(&last_target.to_be_bytes());
    let next = last * BigUint::from(clamped) / BigUint::from(expected as u64);
    let limit = BigUint::from_bytes_be(&params.pow_limit.to_be_bytes());
    if next >= limit {
        return params.pow_limit;
    }
    // Below the limit, hence representable
    let next = DifficultyTarget::from_biguint(&next).unwrap_or(params.pow_limit);
    Target::from_compact(Target::from(next).to_compact_lossy()).into()
}

/// Difficulty context carried from one header to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochState {
    /// Target in force for the current epoch
    pub target: DifficultyTarget,
    /// Target of the epoch before the current one
    pub previous_target: DifficultyTarget,
    /// Epochs crossed since the anchor, 0 is the anchor's own epoch
    pub virtual_epoch_index: u32,
    /// Timestamp of the first block of the current epoch
    pub epoch_start_timestamp: u32,
}

/// Validate the header's bits for its position and roll the epoch state forward.
///
/// `delta` is the header's distance from the anchor, the anchor itself sits on an
/// epoch boundary. `prev_timestamp` is the timestamp of the preceding header.
pub fn validate_epoch(
    header: &BlockHeader,
    delta: u64,
    prev_timestamp: u32,
    state: &EpochState,
    params: &ChainParams,
) -> Result<EpochState> {
    let found = header.bits.to_consensus();

    if !params.is_epoch_boundary(delta) {
        // Exact bits, another encoding of the same target is still invalid
        let expected = bits_from_target(&state.target);
        if found != expected {
            return Err(ProverError::InvalidDifficultyEpoch {
                block_hash: header_hash(header),
                expected,
                found,
            });
        }
        return Ok(*state);
    }

    let next_target = if params.no_retargeting {
        state.target
    } else {
        let timespan = prev_timestamp as i64 - state.epoch_start_timestamp as i64;
        retarget(&state.target, timespan, params)
    };
    let expected = bits_from_target(&next_target);
    if found != expected {
        return Err(ProverError::InvalidDifficultyEpoch {
            block_hash: header_hash(header),
            expected,
            found,
        });
    }

    let next = EpochState {
        target: target_from_bits(found)?,
        previous_target: state.target,
        virtual_epoch_index: state.virtual_epoch_index + 1,
        epoch_start_timestamp: header.time,
    };
    debug!(
        "Crossed epoch boundary at delta {}: bits {:#010x}, virtual epoch {}",
        delta, found, next.virtual_epoch_index
    );
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::constants::genesis_block;

    fn regtest_params() -> ChainParams {
        ChainParams {
            no_retargeting: false,
            ..ChainParams::for_network(Network::Regtest)
        }
    }

    #[test]
    fn test_target_from_bits() {
        let target = target_from_bits(0x1d00ffff).unwrap();
        assert_eq!(
            target.to_hex(),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
        let target = target_from_bits(0x207fffff).unwrap();
        assert_eq!(
            target.to_hex(),
            "7fffff0000000000000000000000000000000000000000000000000000000000"
        );
        // Exponent below 3 shifts the mantissa right
        assert_eq!(
            target_from_bits(0x02008000).unwrap(),
            DifficultyTarget::from_biguint(&BigUint::from(0x80u32)).unwrap()
        );
        // Sign bit without a mantissa is zero, not negative
        assert_eq!(target_from_bits(0x04800000).unwrap(), DifficultyTarget::default());
    }

    #[test]
    fn test_target_from_bits_rejects_invalid() {
        assert!(matches!(
            target_from_bits(0x04923456),
            Err(ProverError::MalformedInput(_))
        ));
        assert!(matches!(
            target_from_bits(0xff123456),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_bits_from_target() {
        for bits in [0x1d00ffff, 0x1b0404cb, 0x207fffff, 0x1715a35c, 0x03123456] {
            let target = target_from_bits(bits).unwrap();
            assert_eq!(bits_from_target(&target), bits);
        }
        // Mantissa with the sign bit set moves into the next exponent
        let target = DifficultyTarget::from_biguint(&BigUint::from(0x80u32)).unwrap();
        assert_eq!(bits_from_target(&target), 0x02008000);
    }

    #[test]
    fn test_genesis_meets_target() {
        let genesis = genesis_block(Network::Bitcoin).header;
        let target = target_from_bits(genesis.bits.to_consensus()).unwrap();
        check_proof_of_work(&genesis, &target).unwrap();

        // The genesis hash does not meet a 65536x harder target
        let harder = target_from_bits(0x1b00ffff).unwrap();
        assert!(matches!(
            check_proof_of_work(&genesis, &harder),
            Err(ProverError::InvalidBlockHash { .. })
        ));
    }

    #[test]
    fn test_retarget_unchanged_on_schedule() {
        let params = ChainParams::default();
        let target = target_from_bits(0x1b0404cb).unwrap();
        let next = retarget(&target, params.target_timespan as i64, &params);
        assert_eq!(next, target);
    }

    #[test]
    fn test_retarget_clamps_timespan() {
        let params = ChainParams::default();
        let target = target_from_bits(0x1b0404cb).unwrap();
        let t = params.target_timespan as i64;

        let fast = retarget(&target, 1, &params);
        assert_eq!(bits_from_target(&fast), 0x1b010132);

        let negative = retarget(&target, -1000, &params);
        assert_eq!(negative, fast);

        let slow = retarget(&target, 10 * t, &params);
        assert_eq!(bits_from_target(&slow), 0x1b10132c);
    }

    #[test]
    fn test_retarget_agrees_with_next_work_required() {
        let params = ChainParams::default();
        let consensus = Params::new(Network::Bitcoin);
        let t = params.target_timespan as i64;
        for bits in [0x1d00ffff, 0x1c0ae493, 0x1b0404cb, 0x1a05db8b, 0x17034219] {
            for timespan in [1, t / 4 + 1, t / 2, t - 7, t, t + 3600, 3 * t, 5 * t] {
                let next = retarget(&target_from_bits(bits).unwrap(), timespan, &params);
                let expected = CompactTarget::from_next_work_required(
                    CompactTarget::from_consensus(bits),
                    timespan as u64,
                    &consensus,
                );
                assert_eq!(bits_from_target(&next), expected.to_consensus());
                assert_eq!(next, Target::from_compact(expected).into());
            }
        }
    }

    #[test]
    fn test_retarget_capped_at_pow_limit() {
        let params = ChainParams::default();
        let target = target_from_bits(0x1d00ffff).unwrap();
        let next = retarget(&target, 2 * params.target_timespan as i64, &params);
        assert_eq!(next, params.pow_limit);
        assert_eq!(bits_from_target(&next), 0x1d00ffff);
    }

    #[test]
    fn test_retarget_halving_rounds_through_compact() {
        let params = regtest_params();
        let target = target_from_bits(0x207fffff).unwrap();
        let next = retarget(&target, params.target_timespan as i64 / 2, &params);
        assert_eq!(bits_from_target(&next), 0x203fffff);
    }

    #[test]
    fn test_validate_epoch_within_epoch() {
        let params = ChainParams::default();
        let mut header = genesis_block(Network::Bitcoin).header;
        let state = EpochState {
            target: target_from_bits(0x1d00ffff).unwrap(),
            previous_target: target_from_bits(0x1d00ffff).unwrap(),
            virtual_epoch_index: 0,
            epoch_start_timestamp: header.time,
        };
        assert_eq!(
            validate_epoch(&header, 5, header.time, &state, &params).unwrap(),
            state
        );

        header.bits = CompactTarget::from_consensus(0x1c00ffff);
        let err = validate_epoch(&header, 5, header.time, &state, &params).unwrap_err();
        assert!(matches!(
            err,
            ProverError::InvalidDifficultyEpoch {
                expected: 0x1d00ffff,
                found: 0x1c00ffff,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_epoch_requires_exact_bits() {
        let params = ChainParams::default();
        let mut header = genesis_block(Network::Bitcoin).header;
        let state = EpochState {
            target: target_from_bits(0x1d00ff00).unwrap(),
            previous_target: target_from_bits(0x1d00ff00).unwrap(),
            virtual_epoch_index: 0,
            epoch_start_timestamp: header.time,
        };

        // Same target, non-canonical encoding
        header.bits = CompactTarget::from_consensus(0x1e0000ff);
        assert_eq!(target_from_bits(0x1e0000ff).unwrap(), state.target);
        let err = validate_epoch(&header, 7, header.time, &state, &params).unwrap_err();
        assert!(matches!(
            err,
            ProverError::InvalidDifficultyEpoch {
                expected: 0x1d00ff00,
                found: 0x1e0000ff,
                ..
            }
        ));
    }

    #[test]
    fn test_mainnet_retarget_at_32256() {
        // Mainnet epoch 30240..=32255 ran fast, block 32256 carries 0x1d00d86a
        let params = ChainParams::default();
        let state = EpochState {
            target: target_from_bits(0x1d00ffff).unwrap(),
            previous_target: target_from_bits(0x1d00ffff).unwrap(),
            virtual_epoch_index: 15,
            epoch_start_timestamp: 1261130161,
        };
        let block_32255_time = 1262152739;
        let mut header = genesis_block(Network::Bitcoin).header;
        header.time = block_32255_time + 600;
        header.bits = CompactTarget::from_consensus(0x1d00d86a);

        let next = validate_epoch(&header, 32256, block_32255_time, &state, &params).unwrap();
        assert_eq!(bits_from_target(&next.target), 0x1d00d86a);
        assert_eq!(next.previous_target, state.target);
        assert_eq!(next.virtual_epoch_index, 16);
        assert_eq!(next.epoch_start_timestamp, header.time);

        for tampered in [0x1d00d86b, 0x1d00ffff] {
            header.bits = CompactTarget::from_consensus(tampered);
            let err =
                validate_epoch(&header, 32256, block_32255_time, &state, &params).unwrap_err();
            assert!(matches!(
                err,
                ProverError::InvalidDifficultyEpoch {
                    expected: 0x1d00d86a,
                    found,
                    ..
                } if found == tampered
            ));
        }
    }

    #[test]
    fn test_validate_epoch_at_boundary() {
        let params = regtest_params();
        let start = 1_700_000_000u32;
        let state = EpochState {
            target: target_from_bits(0x207fffff).unwrap(),
            previous_target: target_from_bits(0x207fffff).unwrap(),
            virtual_epoch_index: 0,
            epoch_start_timestamp: start,
        };
        let prev_timestamp = start + params.target_timespan / 2;
        let mut header = genesis_block(Network::Regtest).header;
        header.time = prev_timestamp + 600;

        // Unchanged bits are wrong after a fast epoch
        let err = validate_epoch(&header, 2016, prev_timestamp, &state, &params).unwrap_err();
        assert!(matches!(
            err,
            ProverError::InvalidDifficultyEpoch {
                expected: 0x203fffff,
                ..
            }
        ));

        header.bits = CompactTarget::from_consensus(0x203fffff);
        let next = validate_epoch(&header, 2016, prev_timestamp, &state, &params).unwrap();
        assert_eq!(next.virtual_epoch_index, 1);
        assert_eq!(next.previous_target, state.target);
        assert_eq!(next.target, target_from_bits(0x203fffff).unwrap());
        assert_eq!(next.epoch_start_timestamp, header.time);
    }

    #[test]
    fn test_no_retargeting_network_keeps_bits() {
        let params = ChainParams::for_network(Network::Regtest);
        assert!(params.no_retargeting);
        let state = EpochState {
            target: target_from_bits(0x207fffff).unwrap(),
            previous_target: target_from_bits(0x207fffff).unwrap(),
            virtual_epoch_index: 0,
            epoch_start_timestamp: 0,
        };
        let header = genesis_block(Network::Regtest).header;
        let next = validate_epoch(&header, 2016, 1, &state, &params).unwrap();
        assert_eq!(next.target, state.target);
        assert_eq!(next.virtual_epoch_index, 1);
    }
}
