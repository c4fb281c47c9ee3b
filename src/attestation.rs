/**
 * Attestation Service
 * Binds a freshly generated key to its creation parameters and challenge,
 * signed by the device attestation root
 */

use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1,
    ECDSA_P256_SHA256_ASN1_SIGNING,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::encoding::{from_base64, to_base64};
use crate::keystore::{DigestAlgorithm, EcCurve, KeyGenSpec, KeyPurpose};

pub const CHALLENGE_LEN: usize = 32;

const SECURITY_LEVEL: &str = "software";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub document: String, // Base64-encoded attestation document
    pub signature: String, // Base64 DER signature by the attestation root
    pub root_public_key: String,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub security_level: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub alias: String,
    pub public_key_digest: String,
    pub challenge: String,
    pub curve: EcCurve,
    pub digests: Vec<DigestAlgorithm>,
    pub purposes: Vec<KeyPurpose>,
    pub user_authentication_required: bool,
    pub security_level: String,
    pub timestamp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("random source unavailable")]
    Rng,
    #[error("attestation root key: {0}")]
    RootKey(String),
    #[error("failed to sign attestation document")]
    Signing,
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("malformed attestation: {0}")]
    Malformed(String),
    #[error("attestation root is not trusted")]
    UntrustedRoot,
    #[error("attestation signature does not verify")]
    BadSignature,
    #[error("attested public key does not match")]
    PublicKeyMismatch,
    #[error("attestation challenge does not match")]
    ChallengeMismatch,
}

/// Fresh random challenge for a key generation request.
pub fn generate_challenge() -> Result<[u8; CHALLENGE_LEN], AttestationError> {
    let mut challenge = [0u8; CHALLENGE_LEN];
    SystemRandom::new()
        .fill(&mut challenge)
        .map_err(|_| AttestationError::Rng)?;
    Ok(challenge)
}

pub fn public_key_digest(public_key: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(public_key)))
}

pub struct AttestationService {
    model: String,
    root: EcdsaKeyPair,
    rng: SystemRandom,
}

impl AttestationService {
    pub fn new(model: impl Into<String>) -> Result<Self, AttestationError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| AttestationError::RootKey("generation failed".to_string()))?;
        let root = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| AttestationError::RootKey(e.to_string()))?;

        Ok(Self {
            model: model.into(),
            root,
            rng,
        })
    }

    pub fn root_public_key(&self) -> &[u8] {
        self.root.public_key().as_ref()
    }

    pub fn generate(
        &self,
        spec: &KeyGenSpec,
        public_key: &[u8],
    ) -> Result<Attestation, AttestationError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let document = AttestationDocument {
            alias: spec.alias.clone(),
            public_key_digest: public_key_digest(public_key),
            challenge: to_base64(&spec.attestation_challenge),
            curve: spec.curve,
            digests: spec.digests.clone(),
            purposes: spec.purposes.clone(),
            user_authentication_required: spec.user_authentication_required,
            security_level: SECURITY_LEVEL.to_string(),
            timestamp,
        };

        let document_bytes = serde_json::to_vec(&document)
            .map_err(|e| AttestationError::Serialization(e.to_string()))?;

        let signature = self
            .root
            .sign(&self.rng, &document_bytes)
            .map_err(|_| AttestationError::Signing)?;

        Ok(Attestation {
            document: to_base64(&document_bytes),
            signature: to_base64(signature.as_ref()),
            root_public_key: to_base64(self.root_public_key()),
            device_info: DeviceInfo {
                model: self.model.clone(),
                security_level: SECURITY_LEVEL.to_string(),
                timestamp,
            },
        })
    }
}

impl Attestation {
    pub fn decode_document(&self) -> Result<AttestationDocument, AttestationError> {
        let bytes = from_base64(&self.document)
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AttestationError::Malformed(e.to_string()))
    }

    /// Check the record was issued by `trusted_root` for `public_key` with `expected_challenge`.
    pub fn verify(
        &self,
        trusted_root: &[u8],
        public_key: &[u8],
        expected_challenge: &[u8],
    ) -> Result<AttestationDocument, AttestationError> {
        let root = from_base64(&self.root_public_key)
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        if root != trusted_root {
            return Err(AttestationError::UntrustedRoot);
        }

        let document_bytes = from_base64(&self.document)
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        let signature = from_base64(&self.signature)
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, &root)
            .verify(&document_bytes, &signature)
            .map_err(|_| AttestationError::BadSignature)?;

        let document: AttestationDocument = serde_json::from_slice(&document_bytes)
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        if document.public_key_digest != public_key_digest(public_key) {
            return Err(AttestationError::PublicKeyMismatch);
        }
        let challenge = from_base64(&document.challenge)
            .map_err(|e| AttestationError::Malformed(e.to_string()))?;
        if challenge != expected_challenge {
            return Err(AttestationError::ChallengeMismatch);
        }

        Ok(document)
    }
}
