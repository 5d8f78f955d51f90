//! Attested signer and witness quorum verification, plus the signers that produce them.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use tracing::debug;

use crate::error::{ProverError, Result};
use crate::proof::{FullComputationsProof, WitnessSignature};

/// Length of a recoverable signature: recovery id followed by compact r||s
pub const RECOVERABLE_SIGNATURE_SIZE: usize = 65;

/// Message digest every signature commits to.
pub fn computations_digest(computations_result: &[u8]) -> Message {
    Message::from_digest(sha256::Hash::hash(computations_result).to_byte_array())
}

/// Check a recoverable signature against the single trusted signer key.
pub fn verify_attested(computations_result: &[u8], signature: &[u8], signer: &PublicKey) -> bool {
    if signature.len() != RECOVERABLE_SIGNATURE_SIZE {
        return false;
    }
    let Ok(recovery_id) = RecoveryId::from_i32(signature[0] as i32) else {
        return false;
    };
    let Ok(signature) = RecoverableSignature::from_compact(&signature[1..], recovery_id) else {
        return false;
    };
    let message = computations_digest(computations_result);
    match SECP256K1.recover_ecdsa(&message, &signature) {
        Ok(recovered) => recovered == *signer,
        Err(_) => false,
    }
}

/// Count distinct configured witnesses with a valid DER signature over the result.
pub fn count_witness_signatures(
    computations_result: &[u8],
    signatures: &[WitnessSignature],
    witnesses: &BTreeSet<PublicKey>,
) -> usize {
    let message = computations_digest(computations_result);
    let mut seen = HashSet::new();
    for witness in signatures {
        let Ok(public_key) = PublicKey::from_slice(&witness.public_key) else {
            continue;
        };
        if !witnesses.contains(&public_key) || seen.contains(&public_key) {
            continue;
        }
        let Ok(signature) = Signature::from_der(&witness.signature) else {
            continue;
        };
        if SECP256K1
            .verify_ecdsa(&message, &signature, &public_key)
            .is_ok()
        {
            seen.insert(public_key);
        }
    }
    seen.len()
}

/// `min_witness == 0` trusts the attested signer alone.
pub fn verify_witness_quorum(
    computations_result: &[u8],
    signatures: &[WitnessSignature],
    witnesses: &BTreeSet<PublicKey>,
    min_witness: usize,
) -> bool {
    min_witness == 0
        || count_witness_signatures(computations_result, signatures, witnesses) >= min_witness
}

/// Verifier holding the trust configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationVerifier {
    signer: PublicKey,
    witnesses: BTreeSet<PublicKey>,
    min_witness: usize,
}

impl AttestationVerifier {
    pub fn new(
        signer: PublicKey,
        witnesses: impl IntoIterator<Item = PublicKey>,
        min_witness: usize,
    ) -> Result<Self> {
        let mut verifier = Self {
            signer,
            witnesses: BTreeSet::new(),
            min_witness: 0,
        };
        verifier.set_witnesses(witnesses)?;
        verifier.set_min_witness(min_witness)?;
        Ok(verifier)
    }

    pub fn signer(&self) -> &PublicKey {
        &self.signer
    }

    pub fn witnesses(&self) -> &BTreeSet<PublicKey> {
        &self.witnesses
    }

    pub fn min_witness(&self) -> usize {
        self.min_witness
    }

    /// Replacing the set must keep the current threshold reachable.
    pub fn set_witnesses(&mut self, witnesses: impl IntoIterator<Item = PublicKey>) -> Result<()> {
        let witnesses: BTreeSet<_> = witnesses.into_iter().collect();
        if self.min_witness > witnesses.len() {
            return Err(ProverError::MalformedInput(format!(
                "minimum witness count {} exceeds witness set size {}",
                self.min_witness,
                witnesses.len()
            )));
        }
        self.witnesses = witnesses;
        Ok(())
    }

    pub fn set_min_witness(&mut self, min_witness: usize) -> Result<()> {
        if min_witness > self.witnesses.len() {
            return Err(ProverError::MalformedInput(format!(
                "minimum witness count {} exceeds witness set size {}",
                min_witness,
                self.witnesses.len()
            )));
        }
        self.min_witness = min_witness;
        Ok(())
    }

    /// Signer check first, then the quorum.
    pub fn verify(&self, proof: &FullComputationsProof) -> Result<()> {
        let partial = &proof.partial_proof;
        if !verify_attested(
            &partial.computations_result,
            &partial.contract_signature,
            &self.signer,
        ) {
            return Err(ProverError::SignatureInvalid);
        }
        if self.min_witness > 0 {
            let found = count_witness_signatures(
                &partial.computations_result,
                &proof.witness_signatures,
                &self.witnesses,
            );
            if found < self.min_witness {
                return Err(ProverError::QuorumNotMet {
                    required: self.min_witness,
                    found,
                });
            }
            debug!("Witness quorum met: {}/{}", found, self.min_witness);
        }
        Ok(())
    }
}

/// Key holder that attests computation results.
pub trait ComputationSigner: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// 65-byte recoverable signature over [`computations_digest`].
    fn sign(&self, computations_result: &[u8]) -> Result<Vec<u8>>;
}

fn sign_recoverable(secret_key: &SecretKey, computations_result: &[u8]) -> Vec<u8> {
    let message = computations_digest(computations_result);
    let (recovery_id, compact) = SECP256K1
        .sign_ecdsa_recoverable(&message, secret_key)
        .serialize_compact();
    let mut signature = Vec::with_capacity(RECOVERABLE_SIGNATURE_SIZE);
    signature.push(recovery_id.to_i32() as u8);
    signature.extend_from_slice(&compact);
    signature
}

/// Production signer backed by the enclave's sealed key.
pub struct EnclaveSigner {
    secret_key: SecretKey,
}

impl EnclaveSigner {
    /// Load a hex encoded secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let secret_key = SecretKey::from_str(secret_hex.trim())
            .map_err(|e| ProverError::MalformedInput(format!("invalid signer secret key: {e}")))?;
        Ok(Self { secret_key })
    }

    /// Load the key from a sealed key file containing the hex secret.
    pub fn from_sealed_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProverError::MalformedInput(format!("cannot read sealed key {}: {e}", path.display()))
        })?;
        Self::from_hex(&contents)
    }
}

impl ComputationSigner for EnclaveSigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.secret_key)
    }

    fn sign(&self, computations_result: &[u8]) -> Result<Vec<u8>> {
        Ok(sign_recoverable(&self.secret_key, computations_result))
    }
}

/// Independent co-signer adding DER signatures to produced proofs.
pub struct WitnessKey {
    secret_key: SecretKey,
}

impl WitnessKey {
    pub fn new(secret_key: SecretKey) -> Self {
        Self { secret_key }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.secret_key)
    }

    pub fn sign(&self, computations_result: &[u8]) -> WitnessSignature {
        let message = computations_digest(computations_result);
        let signature = SECP256K1.sign_ecdsa(&message, &self.secret_key);
        WitnessSignature {
            public_key: self.public_key().serialize().to_vec(),
            signature: signature.serialize_der().to_vec(),
        }
    }

    /// Append this witness's signature to the proof.
    pub fn cosign(&self, proof: &mut FullComputationsProof) {
        let signature = self.sign(&proof.partial_proof.computations_result);
        proof.witness_signatures.push(signature);
    }
}

/// Deterministic signer used by tests and local tooling.
#[cfg(any(test, feature = "test-utils"))]
pub struct FixedKeySigner {
    secret_key: SecretKey,
}

#[cfg(any(test, feature = "test-utils"))]
impl FixedKeySigner {
    pub fn from_seed(seed: u8) -> Self {
        Self {
            secret_key: seeded_secret_key(seed),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl ComputationSigner for FixedKeySigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.secret_key)
    }

    fn sign(&self, computations_result: &[u8]) -> Result<Vec<u8>> {
        Ok(sign_recoverable(&self.secret_key, computations_result))
    }
}

/// Secret key with every byte zero except the last, which holds the seed.
#[cfg(any(test, feature = "test-utils"))]
pub fn seeded_secret_key(seed: u8) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed.max(1);
    SecretKey::from_slice(&bytes).expect("small scalars are valid secret keys")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::PartialComputationsProof;

    fn witness_keys(n: u8) -> Vec<WitnessKey> {
        (0..n)
            .map(|i| WitnessKey::new(seeded_secret_key(100 + i)))
            .collect()
    }

    fn signed_proof(signer: &FixedKeySigner, payload: &[u8]) -> FullComputationsProof {
        FullComputationsProof {
            partial_proof: PartialComputationsProof {
                computations_result: payload.to_vec(),
                contract_signature: signer.sign(payload).unwrap(),
            },
            witness_signatures: vec![],
        }
    }

    #[test]
    fn test_attested_signature() {
        let signer = FixedKeySigner::from_seed(1);
        let other = FixedKeySigner::from_seed(2);
        let payload = b"block chunk result";

        let signature = signer.sign(payload).unwrap();
        assert_eq!(signature.len(), RECOVERABLE_SIGNATURE_SIZE);
        assert!(verify_attested(payload, &signature, &signer.public_key()));
        assert!(!verify_attested(payload, &signature, &other.public_key()));
        assert!(!verify_attested(b"tampered result", &signature, &signer.public_key()));
        assert!(!verify_attested(payload, &signature[1..], &signer.public_key()));

        let mut bad_recovery = signature.clone();
        bad_recovery[0] = 7;
        assert!(!verify_attested(payload, &bad_recovery, &signer.public_key()));
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let signer = FixedKeySigner::from_seed(1);
        let verifier =
            AttestationVerifier::new(FixedKeySigner::from_seed(2).public_key(), vec![], 0).unwrap();
        let proof = signed_proof(&signer, b"result");
        assert_eq!(verifier.verify(&proof), Err(ProverError::SignatureInvalid));

        let mut tampered = signed_proof(&signer, b"result");
        tampered.partial_proof.computations_result[0] ^= 1;
        let verifier = AttestationVerifier::new(signer.public_key(), vec![], 0).unwrap();
        assert_eq!(verifier.verify(&tampered), Err(ProverError::SignatureInvalid));
    }

    #[test]
    fn test_witness_quorum_half_of_set() {
        let signer = FixedKeySigner::from_seed(1);
        let witnesses = witness_keys(5);
        let threshold = (witnesses.len() + 1) / 2;
        let verifier = AttestationVerifier::new(
            signer.public_key(),
            witnesses.iter().map(WitnessKey::public_key),
            threshold,
        )
        .unwrap();

        let mut proof = signed_proof(&signer, b"anchor result");
        for witness in &witnesses[..threshold - 1] {
            witness.cosign(&mut proof);
        }
        assert_eq!(
            verifier.verify(&proof),
            Err(ProverError::QuorumNotMet {
                required: 3,
                found: 2
            })
        );

        // A forged signature from a key outside the set does not count
        let outsider = WitnessKey::new(seeded_secret_key(42));
        outsider.cosign(&mut proof);
        assert!(verifier.verify(&proof).is_err());

        // Nor does a duplicate from an already counted witness
        witnesses[0].cosign(&mut proof);
        assert!(verifier.verify(&proof).is_err());

        witnesses[threshold - 1].cosign(&mut proof);
        verifier.verify(&proof).unwrap();
    }

    #[test]
    fn test_malformed_witness_entries_do_not_count() {
        let signer = FixedKeySigner::from_seed(1);
        let witnesses = witness_keys(2);
        let set: BTreeSet<_> = witnesses.iter().map(WitnessKey::public_key).collect();
        let payload = b"result";

        let mut forged = witnesses[0].sign(payload);
        forged.signature = witnesses[1].sign(payload).signature;
        let garbage = WitnessSignature {
            public_key: vec![2; 10],
            signature: vec![0; 70],
        };
        let mut other_payload = witnesses[1].sign(b"other result");
        other_payload.public_key = witnesses[1].public_key().serialize().to_vec();

        let count = count_witness_signatures(payload, &[forged, garbage, other_payload], &set);
        assert_eq!(count, 0);
        assert!(verify_witness_quorum(payload, &[], &set, 0));
        assert!(!verify_witness_quorum(payload, &[], &set, 1));

        let proof = signed_proof(&signer, payload);
        let verifier = AttestationVerifier::new(signer.public_key(), set, 0).unwrap();
        verifier.verify(&proof).unwrap();
    }

    #[test]
    fn test_min_witness_bounded_by_set() {
        let signer = FixedKeySigner::from_seed(1);
        let witnesses = witness_keys(2);
        assert!(matches!(
            AttestationVerifier::new(
                signer.public_key(),
                witnesses.iter().map(WitnessKey::public_key),
                3
            ),
            Err(ProverError::MalformedInput(_))
        ));

        let mut verifier = AttestationVerifier::new(
            signer.public_key(),
            witnesses.iter().map(WitnessKey::public_key),
            2,
        )
        .unwrap();
        assert!(verifier.set_witnesses(vec![]).is_err());
        verifier.set_min_witness(0).unwrap();
        verifier.set_witnesses(vec![]).unwrap();
        assert!(verifier.witnesses().is_empty());
    }

    #[test]
    fn test_enclave_signer_from_hex() {
        let hex_key = "0000000000000000000000000000000000000000000000000000000000000001";
        let signer = EnclaveSigner::from_hex(hex_key).unwrap();
        assert_eq!(signer.public_key(), FixedKeySigner::from_seed(1).public_key());
        let signature = signer.sign(b"payload").unwrap();
        assert!(verify_attested(b"payload", &signature, &signer.public_key()));
        assert!(EnclaveSigner::from_hex("zz").is_err());
    }
}
