//! 256-bit difficulty targets and proof hashes with hex helpers.

use std::fmt;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::Target;
use num_bigint::BigUint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProverError, Result};

/// 256-bit proof-of-work target, big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DifficultyTarget([u8; 32]);

impl DifficultyTarget {
    pub const fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        decode_hex32(hex).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Fails when the value does not fit into 256 bits.
    pub fn from_biguint(value: &BigUint) -> Result<Self> {
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return Err(ProverError::MalformedInput(format!(
                "target overflows 256 bits: {} bytes",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(Self(out))
    }

}

impl From<Target> for DifficultyTarget {
    fn from(target: Target) -> Self {
        Self(target.to_be_bytes())
    }
}

impl From<DifficultyTarget> for Target {
    fn from(target: DifficultyTarget) -> Self {
        Target::from_be_bytes(target.0)
    }
}

impl fmt::Debug for DifficultyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DifficultyTarget({})", self.to_hex())
    }
}

impl fmt::Display for DifficultyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// SHA-256 digest linking a proof to the payload of its predecessor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProofHash([u8; 32]);

impl ProofHash {
    /// Link value of a chain that starts directly at an anchor
    pub const ZERO: ProofHash = ProofHash([0u8; 32]);

    /// Canonical hash of an encoded computation result.
    pub fn of(payload: &[u8]) -> Self {
        Self(sha256::Hash::hash(payload).to_byte_array())
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        decode_hex32(hex).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ProofHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofHash({})", self.to_hex())
    }
}

impl fmt::Display for ProofHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn decode_hex32(hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex.trim_start_matches("0x"))
        .map_err(|e| ProverError::MalformedInput(format!("invalid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ProverError::MalformedInput("Invalid 32-byte value length".into()))
}

// Hex strings for JSON, raw bytes for bincode payloads.
macro_rules! impl_serde_bytes32 {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let hex = String::deserialize(deserializer)?;
                    $ty::from_hex(&hex).map_err(de::Error::custom)
                } else {
                    <[u8; 32]>::deserialize(deserializer).map($ty)
                }
            }
        }
    };
}

impl_serde_bytes32!(DifficultyTarget);
impl_serde_bytes32!(ProofHash);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_hex_roundtrip() {
        let hex = "00000000ffff0000000000000000000000000000000000000000000000000000";
        let target = DifficultyTarget::from_hex(hex).unwrap();
        assert_eq!(target.to_hex(), hex);
        assert_eq!(Target::from(target), Target::MAX_ATTAINABLE_MAINNET);
        assert!(DifficultyTarget::from_hex("00ff").is_err());
    }

    #[test]
    fn test_target_overflow() {
        let too_big = BigUint::from(1u32) << 256u32;
        assert!(matches!(
            DifficultyTarget::from_biguint(&too_big),
            Err(ProverError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_json_uses_hex() {
        let hash = ProofHash::of(b"payload");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ProofHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_bincode_uses_raw_bytes() {
        let target = DifficultyTarget::from_be_bytes([7u8; 32]);
        let encoded = bincode::serialize(&target).unwrap();
        assert_eq!(encoded, vec![7u8; 32]);
    }

    #[test]
    fn test_proof_hash_is_sha256() {
        assert_eq!(
            ProofHash::of(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(ProofHash::ZERO.is_zero());
    }
}
