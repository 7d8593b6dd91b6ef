//! Tamper-evident improvement proofs.
//!
//! A proof summarises whether a cycle improved the population's average
//! score and seals the summary with SHA-256 over canonical JSON (keys
//! sorted, no whitespace). Anyone holding the proof can recompute the hash
//! with [`verify_proof`].
//!
//! With the `signing` feature a [`ProofSigner`] also signs the proof hash
//! with ed25519, so a proof can be attributed to the kernel that made it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::error;
use uuid::Uuid;

use crate::genome::Genome;

/// Proof format version.
pub const PROOF_VERSION: &str = "2.0";

/// Sealed before/after summary of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementProof {
    /// Pod the cycle ran for.
    pub pod: String,
    /// Cycle id.
    pub cycle_id: Uuid,
    /// Mean fitness of the initial population.
    pub avg_score_before: f64,
    /// Mean fitness of the final population.
    pub avg_score_after: f64,
    /// `after - before`, rounded to 6 decimals.
    pub delta: f64,
    /// `after > before`.
    pub improved: bool,
    /// SHA-256 hex of the winning genome's JSON.
    pub genome_hash: String,
    /// Fitness evaluations performed.
    pub n_calls: usize,
    /// Format version.
    pub version: String,
    /// SHA-256 hex over every other field.
    pub proof_hash: String,
    /// Hex ed25519 signature over `proof_hash`, when signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Hex public key of the signer, when signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

/// Fields that seal the proof rather than describe the cycle.
const SEAL_FIELDS: [&str; 3] = ["proof_hash", "signature", "signer"];

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ImprovementProof {
    /// Build and seal a proof.
    pub fn new(
        pod: &str,
        cycle_id: Uuid,
        avg_score_before: f64,
        avg_score_after: f64,
        best: &Genome,
        n_calls: usize,
    ) -> Self {
        let genome_json = serde_json::to_string(best.genes()).unwrap_or_default();
        let mut proof = Self {
            pod: pod.to_string(),
            cycle_id,
            avg_score_before: round6(avg_score_before),
            avg_score_after: round6(avg_score_after),
            delta: round6(avg_score_after - avg_score_before),
            improved: avg_score_after > avg_score_before,
            genome_hash: sha256_hex(genome_json.as_bytes()),
            n_calls,
            version: PROOF_VERSION.to_string(),
            proof_hash: String::new(),
            signature: None,
            signer: None,
        };
        proof.proof_hash = proof.compute_hash();
        proof
    }

    /// Hash of every descriptive field; the hash and signature are excluded.
    pub fn compute_hash(&self) -> String {
        let canonical: BTreeMap<String, Value> = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map
                .into_iter()
                .filter(|(k, _)| !SEAL_FIELDS.contains(&k.as_str()))
                .collect(),
            _ => BTreeMap::new(),
        };
        let payload = serde_json::to_string(&canonical).unwrap_or_default();
        sha256_hex(payload.as_bytes())
    }
}

/// `true` if `proof.proof_hash` matches its contents.
pub fn verify_proof(proof: &ImprovementProof) -> bool {
    let valid = proof.compute_hash() == proof.proof_hash;
    if !valid {
        error!(pod = %proof.pod, cycle_id = %proof.cycle_id, "improvement proof hash mismatch");
    }
    valid
}

/// Signs proofs with an ed25519 key.
#[cfg(feature = "signing")]
pub struct ProofSigner {
    key: ed25519_dalek::SigningKey,
}

#[cfg(feature = "signing")]
impl std::fmt::Debug for ProofSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSigner")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "signing")]
impl ProofSigner {
    /// Fresh random key.
    pub fn generate() -> Self {
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Key from its 32 secret bytes.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(secret),
        }
    }

    /// Hex-encoded public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Sign `proof.proof_hash` and record the signer's public key.
    pub fn sign(&self, proof: &mut ImprovementProof) {
        use ed25519_dalek::Signer;
        let signature = self.key.sign(proof.proof_hash.as_bytes());
        proof.signature = Some(hex::encode(signature.to_bytes()));
        proof.signer = Some(self.public_key_hex());
    }
}

/// `true` if the proof is signed, its hash is intact and the signature
/// matches the embedded public key.
#[cfg(feature = "signing")]
pub fn verify_signature(proof: &ImprovementProof) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let (Some(signature), Some(signer)) = (&proof.signature, &proof.signer) else {
        return false;
    };
    if !verify_proof(proof) {
        return false;
    }
    let key = hex::decode(signer)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .and_then(|b| VerifyingKey::from_bytes(&b).ok());
    let sig = hex::decode(signature)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .map(|b| Signature::from_bytes(&b));
    match (key, sig) {
        (Some(key), Some(sig)) => key.verify(proof.proof_hash.as_bytes(), &sig).is_ok(),
        _ => {
            error!(pod = %proof.pod, cycle_id = %proof.cycle_id, "malformed proof signature");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImprovementProof {
        let genome = Genome::clamped(vec![0.1, 0.9, 0.5]);
        ImprovementProof::new("aurora", Uuid::new_v4(), 1.25, 1.75, &genome, 120)
    }

    #[test]
    fn test_fresh_proof_verifies() {
        let proof = sample();
        assert!(proof.improved);
        assert_eq!(proof.delta, 0.5);
        assert_eq!(proof.proof_hash.len(), 64);
        assert_eq!(proof.genome_hash.len(), 64);
        assert!(verify_proof(&proof));
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut proof = sample();
        proof.avg_score_after = 9.0;
        assert!(!verify_proof(&proof));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let proof = sample();
        assert_eq!(proof.compute_hash(), proof.compute_hash());
        let copy: ImprovementProof =
            serde_json::from_str(&serde_json::to_string(&proof).unwrap()).unwrap();
        assert!(verify_proof(&copy));
    }

    #[test]
    fn test_regression_is_not_improved() {
        let genome = Genome::clamped(vec![0.5]);
        let proof = ImprovementProof::new("dan", Uuid::new_v4(), 2.0, 1.0, &genome, 3);
        assert!(!proof.improved);
        assert_eq!(proof.delta, -1.0);
    }

    #[test]
    fn test_unsigned_proof_omits_seal_fields() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("signature").is_none());
        assert!(json.get("signer").is_none());
    }

    #[cfg(feature = "signing")]
    #[test]
    fn test_signed_proof_verifies_and_keeps_hash() {
        let signer = ProofSigner::from_bytes(&[7u8; 32]);
        let mut proof = sample();
        let hash = proof.proof_hash.clone();
        signer.sign(&mut proof);

        assert_eq!(proof.proof_hash, hash);
        assert!(verify_proof(&proof));
        assert!(verify_signature(&proof));
        assert_eq!(proof.signer.as_deref(), Some(signer.public_key_hex().as_str()));
    }

    #[cfg(feature = "signing")]
    #[test]
    fn test_signature_rejects_tampering_and_foreign_keys() {
        let signer = ProofSigner::generate();
        let mut proof = sample();
        signer.sign(&mut proof);

        let mut tampered = proof.clone();
        tampered.avg_score_after = 9.0;
        tampered.proof_hash = tampered.compute_hash();
        assert!(!verify_signature(&tampered));

        let mut foreign = proof.clone();
        foreign.signer = Some(ProofSigner::generate().public_key_hex());
        assert!(!verify_signature(&foreign));

        assert!(!verify_signature(&sample()), "unsigned proofs do not verify");
    }
}
