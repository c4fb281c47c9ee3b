/**
 * Keystore Signer
 * One key slot: create an attested key, sign with it after user
 * authentication, verify against its certificate
 */

use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use tracing::{info, warn};

use crate::attestation::{self, AttestationError};
use crate::device::{BiometricUnavailable, DeviceCapabilities};
use crate::keystore::{
    Certificate, Entry, KeyGenSpec, KeyStore, KeyStoreError, PrivateKeyEntry, DEFAULT_ALIAS,
};
use crate::prompt::{Authenticator, CancellationSignal, Prompt, PromptError, PromptOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] KeyStoreError),
    #[error("attestation challenge: {0}")]
    Challenge(#[from] AttestationError),
    #[error("no key under alias '{alias}'")]
    KeyNotFound { alias: String },
    #[error("entry under alias '{alias}' is not a private key")]
    UnexpectedEntry { alias: String },
    #[error("authentication not satisfied: {}", PromptOutcome::name(.0))]
    AuthenticationNotSatisfied(PromptOutcome),
    #[error("biometric prompt unavailable: {0}")]
    BiometricUnavailable(#[from] BiometricUnavailable),
    #[error("prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("key store: {0}")]
    Store(#[source] KeyStoreError),
    #[error("signature is missing")]
    MissingSignature,
    #[error("signature does not verify")]
    VerificationFailed,
}

pub struct KeystoreSigner<K, A> {
    store: K,
    authenticator: A,
    alias: String,
    device: DeviceCapabilities,
}

impl<K: KeyStore, A: Authenticator> KeystoreSigner<K, A> {
    pub fn new(store: K, authenticator: A) -> Self {
        Self::with_alias(store, authenticator, DEFAULT_ALIAS)
    }

    pub fn with_alias(store: K, authenticator: A, alias: impl Into<String>) -> Self {
        Self {
            store,
            authenticator,
            alias: alias.into(),
            device: DeviceCapabilities::default(),
        }
    }

    /// Capabilities checked before the unlock prompt is presented.
    pub fn with_device(mut self, device: DeviceCapabilities) -> Self {
        self.device = device;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    pub fn authenticator(&self) -> &A {
        &self.authenticator
    }

    /// Generate a new key pair under the alias, replacing any previous one.
    /// Succeeds only if the new entry can be read back as a private key.
    pub fn create_key(&self) -> Result<Certificate, SignerError> {
        let result = self.try_create_key();
        match &result {
            Ok(certificate) => info!(
                alias = %self.alias,
                public_key = %attestation::public_key_digest(&certificate.public_key),
                "Key created"
            ),
            Err(e) => warn!(alias = %self.alias, error = %e, "Key creation failed"),
        }
        result
    }

    fn try_create_key(&self) -> Result<Certificate, SignerError> {
        let challenge = attestation::generate_challenge()?;
        let spec = KeyGenSpec::signing(self.alias.clone(), challenge);
        self.store
            .generate_key_pair(&spec)
            .map_err(SignerError::KeyGeneration)?;

        // Confirm through a fresh lookup rather than trusting the generator.
        Ok(self.private_key_entry()?.certificate)
    }

    /// Sign the UTF-8 bytes of `message` with ECDSA over SHA-256.
    ///
    /// Auth-bound keys present a biometric prompt first; `cancel` dismisses it.
    /// The prompt is only presented when the device can satisfy it.
    pub async fn sign_data(
        &self,
        message: &str,
        cancel: CancellationSignal,
    ) -> Result<Vec<u8>, SignerError> {
        let result = self.try_sign(message, cancel).await;
        if let Err(e) = &result {
            warn!(alias = %self.alias, error = %e, "Signing failed");
        }
        result
    }

    async fn try_sign(
        &self,
        message: &str,
        cancel: CancellationSignal,
    ) -> Result<Vec<u8>, SignerError> {
        let entry = self.private_key_entry()?;

        let authorization = if entry.user_authentication_required {
            self.device.check_biometric()?;
            let outcome = self
                .authenticator
                .authenticate(Prompt::unlock_key(&self.alias), cancel)
                .await?;
            match outcome.authorization() {
                Some(authorization) => Some(authorization),
                None => return Err(SignerError::AuthenticationNotSatisfied(outcome)),
            }
        } else {
            None
        };

        self.store
            .sign(&self.alias, message.as_bytes(), authorization.as_ref())
            .map_err(SignerError::Store)
    }

    /// Fail-closed verification: anything short of a valid signature is `false`.
    pub fn verify_data(&self, message: &str, signature: Option<&[u8]>) -> bool {
        match self.check_signature(message, signature) {
            Ok(()) => true,
            Err(e) => {
                warn!(alias = %self.alias, error = %e, "Verification failed");
                false
            }
        }
    }

    pub fn check_signature(
        &self,
        message: &str,
        signature: Option<&[u8]>,
    ) -> Result<(), SignerError> {
        let signature = signature.ok_or(SignerError::MissingSignature)?;
        let certificate = self.certificate()?;

        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, &certificate.public_key)
            .verify(message.as_bytes(), signature)
            .map_err(|_| SignerError::VerificationFailed)
    }

    pub fn certificate(&self) -> Result<Certificate, SignerError> {
        Ok(self.private_key_entry()?.certificate)
    }

    fn private_key_entry(&self) -> Result<PrivateKeyEntry, SignerError> {
        match self.store.entry(&self.alias).map_err(SignerError::Store)? {
            Some(Entry::PrivateKey(entry)) => Ok(entry),
            Some(Entry::TrustedCertificate(_)) => Err(SignerError::UnexpectedEntry {
                alias: self.alias.clone(),
            }),
            None => Err(SignerError::KeyNotFound {
                alias: self.alias.clone(),
            }),
        }
    }
}
