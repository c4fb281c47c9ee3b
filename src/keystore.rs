/**
 * Key Store
 * Aliased key pair storage with user-authentication gating.
 * Private key material stays inside the store; callers hold aliases and certificates.
 * On disk, private keys are sealed with AES-256-GCM under an Argon2id-derived key.
 */

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::Argon2;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::attestation::{Attestation, AttestationError, AttestationService, CHALLENGE_LEN};
use crate::encoding::base64_bytes;
use crate::prompt::AuthMethod;

pub const DEFAULT_ALIAS: &str = "MY_KEY";

const MAX_CHALLENGE_LEN: usize = 128;

/// Argon2id salt, one per store directory.
const SALT_FILE: &str = "keystore.salt";
const SALT_LEN: usize = 16;

/// Nonce length for AES-256-GCM.
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    Sign,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcCurve {
    #[serde(rename = "secp256r1")]
    Secp256r1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenSpec {
    pub alias: String,
    pub purposes: Vec<KeyPurpose>,
    pub digests: Vec<DigestAlgorithm>,
    pub curve: EcCurve,
    pub user_authentication_required: bool,
    pub attestation_challenge: Vec<u8>,
}

impl KeyGenSpec {
    /// EC P-256 signing key, SHA-256, bound to user authentication.
    pub fn signing(alias: impl Into<String>, challenge: [u8; CHALLENGE_LEN]) -> Self {
        Self {
            alias: alias.into(),
            purposes: vec![KeyPurpose::Sign],
            digests: vec![DigestAlgorithm::Sha256],
            curve: EcCurve::Secp256r1,
            user_authentication_required: true,
            attestation_challenge: challenge.to_vec(),
        }
    }
}

/// Public half of a key entry, with its attestation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub alias: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>, // Uncompressed SEC1 point
    pub attestation: Attestation,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyEntry {
    pub certificate: Certificate,
    pub user_authentication_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    PrivateKey(PrivateKeyEntry),
    TrustedCertificate(Certificate),
}

/// Proof that the user just passed an authentication prompt.
#[derive(Debug, Clone)]
pub struct UserAuthorization {
    method: AuthMethod,
}

impl UserAuthorization {
    pub(crate) fn new(method: AuthMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("invalid alias '{0}'")]
    InvalidAlias(String),
    #[error("unsupported key parameters: {0}")]
    UnsupportedSpec(String),
    #[error("secure lock screen must be enabled to create auth-bound keys")]
    SecureLockScreenRequired,
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("attestation: {0}")]
    Attestation(#[from] AttestationError),
    #[error("no entry under alias '{0}'")]
    KeyNotFound(String),
    #[error("entry under alias '{0}' is not a private key")]
    NotAPrivateKey(String),
    #[error("user not authenticated")]
    UserNotAuthenticated,
    #[error("signing failed")]
    Signing,
    #[error("storage: {0}")]
    Storage(String),
    #[error("sealing: {0}")]
    Sealing(String),
    #[error("cannot unseal key '{0}' (wrong passphrase?)")]
    Unseal(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait KeyStore: Send + Sync {
    /// Generate a key pair under `spec.alias`, replacing any existing entry.
    fn generate_key_pair(&self, spec: &KeyGenSpec) -> Result<Certificate, KeyStoreError>;

    fn entry(&self, alias: &str) -> Result<Option<Entry>, KeyStoreError>;

    /// ASN.1 DER ECDSA signature over SHA-256 of `data`.
    fn sign(
        &self,
        alias: &str,
        data: &[u8],
        authorization: Option<&UserAuthorization>,
    ) -> Result<Vec<u8>, KeyStoreError>;

    fn set_certificate_entry(&self, alias: &str, certificate: Certificate)
        -> Result<(), KeyStoreError>;

    /// Returns whether an entry was removed.
    fn delete_entry(&self, alias: &str) -> Result<bool, KeyStoreError>;
}

enum Stored {
    PrivateKey {
        key_pair: EcdsaKeyPair,
        entry: PrivateKeyEntry,
    },
    Certificate(Certificate),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredFile {
    PrivateKey {
        sealed: SealedKey,
        certificate: Certificate,
        user_authentication_required: bool,
    },
    TrustedCertificate {
        certificate: Certificate,
    },
}

/// PKCS#8 private key encrypted with AES-256-GCM. The alias is the associated data,
/// so a sealed key only opens under the alias it was written for.
#[derive(Serialize, Deserialize)]
struct SealedKey {
    #[serde(with = "base64_bytes")]
    nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    ciphertext: Vec<u8>,
}

/// Store directory and the key that seals private keys written into it.
struct Disk {
    dir: PathBuf,
    sealing_key: Zeroizing<[u8; 32]>,
}

impl Disk {
    fn open(dir: PathBuf, passphrase: &str, rng: &SystemRandom) -> Result<Self, KeyStoreError> {
        fs::create_dir_all(&dir)?;
        let salt = read_or_create_salt(&dir, rng)?;

        let mut sealing_key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut sealing_key[..])
            .map_err(|e| KeyStoreError::Sealing(e.to_string()))?;

        Ok(Self { dir, sealing_key })
    }

    fn cipher(&self) -> Result<Aes256Gcm, KeyStoreError> {
        Aes256Gcm::new_from_slice(&self.sealing_key[..])
            .map_err(|e| KeyStoreError::Sealing(e.to_string()))
    }

    fn seal(
        &self,
        alias: &str,
        pkcs8: &[u8],
        rng: &SystemRandom,
    ) -> Result<SealedKey, KeyStoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce)
            .map_err(|_| KeyStoreError::Sealing("nonce generation failed".to_string()))?;

        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: pkcs8,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|e| KeyStoreError::Sealing(e.to_string()))?;

        Ok(SealedKey {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    fn unseal(&self, alias: &str, sealed: &SealedKey) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
        if sealed.nonce.len() != NONCE_LEN {
            return Err(KeyStoreError::Storage("invalid nonce length".to_string()));
        }
        self.cipher()?
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: alias.as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| KeyStoreError::Unseal(alias.to_string()))
    }
}

/// Key store backed by ring, optionally persisted as one JSON file per alias.
pub struct SoftwareKeyStore {
    entries: RwLock<HashMap<String, Stored>>,
    disk: Option<Disk>,
    attestation: AttestationService,
    secure_lock_screen: bool,
    rng: SystemRandom,
    tmp_seq: AtomicU64,
}

impl SoftwareKeyStore {
    /// Process-scoped store; nothing touches disk.
    pub fn in_memory(attestation: AttestationService, secure_lock_screen: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            disk: None,
            attestation,
            secure_lock_screen,
            rng: SystemRandom::new(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Store persisted under `dir`; existing entries are loaded and unsealed with `passphrase`.
    ///
    /// Unreadable files are skipped. A key that fails to unseal aborts the open, so a wrong
    /// passphrase never looks like an empty store.
    pub fn open(
        dir: impl Into<PathBuf>,
        passphrase: &str,
        attestation: AttestationService,
        secure_lock_screen: bool,
    ) -> Result<Self, KeyStoreError> {
        let rng = SystemRandom::new();
        let disk = Disk::open(dir.into(), passphrase, &rng)?;

        let mut entries = HashMap::new();
        for item in fs::read_dir(&disk.dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_entry(&path, &disk, &rng) {
                Ok((alias, stored)) => {
                    entries.insert(alias, stored);
                }
                Err(e @ KeyStoreError::Unseal(_)) => return Err(e),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable key entry"),
            }
        }
        info!(dir = %disk.dir.display(), entries = entries.len(), "Key store opened");

        Ok(Self {
            entries: RwLock::new(entries),
            disk: Some(disk),
            attestation,
            secure_lock_screen,
            rng,
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Public key of the root that signs attestation records.
    pub fn attestation_root(&self) -> &[u8] {
        self.attestation.root_public_key()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Stored>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Stored>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_spec(&self, spec: &KeyGenSpec) -> Result<(), KeyStoreError> {
        validate_alias(&spec.alias)?;
        if !spec.purposes.contains(&KeyPurpose::Sign) {
            return Err(KeyStoreError::UnsupportedSpec(
                "signing purpose is required".to_string(),
            ));
        }
        if !spec.digests.contains(&DigestAlgorithm::Sha256) {
            return Err(KeyStoreError::UnsupportedSpec(
                "SHA-256 digest is required".to_string(),
            ));
        }
        if spec.attestation_challenge.len() > MAX_CHALLENGE_LEN {
            return Err(KeyStoreError::UnsupportedSpec(format!(
                "attestation challenge longer than {MAX_CHALLENGE_LEN} bytes"
            )));
        }
        if spec.user_authentication_required && !self.secure_lock_screen {
            return Err(KeyStoreError::SecureLockScreenRequired);
        }
        Ok(())
    }

    /// Write `file` as the entry for `alias`. Callers hold the write guard, so the file
    /// on disk always matches the entry in memory.
    fn persist(&self, disk: &Disk, alias: &str, file: &StoredFile) -> Result<(), KeyStoreError> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|e| KeyStoreError::Storage(e.to_string()))?;

        let tmp = disk.dir.join(format!(
            ".{alias}.{}.{}.tmp",
            std::process::id(),
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        ));
        let written =
            write_private(&tmp, &json).and_then(|()| fs::rename(&tmp, entry_path(&disk.dir, alias)));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(alias, "Key entry persisted");
        Ok(())
    }
}

impl KeyStore for SoftwareKeyStore {
    fn generate_key_pair(&self, spec: &KeyGenSpec) -> Result<Certificate, KeyStoreError> {
        self.check_spec(spec)?;

        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.rng)
            .map_err(|_| KeyStoreError::KeyGeneration("P-256 generation failed".to_string()))?;
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &self.rng)
                .map_err(|e| KeyStoreError::KeyGeneration(e.to_string()))?;

        let public_key = key_pair.public_key().as_ref().to_vec();
        let attestation = self.attestation.generate(spec, &public_key)?;
        let certificate = Certificate {
            alias: spec.alias.clone(),
            public_key,
            attestation,
            created_at: now_secs(),
        };

        let mut entries = self.write();
        if let Some(disk) = &self.disk {
            let sealed = disk.seal(&spec.alias, pkcs8.as_ref(), &self.rng)?;
            self.persist(
                disk,
                &spec.alias,
                &StoredFile::PrivateKey {
                    sealed,
                    certificate: certificate.clone(),
                    user_authentication_required: spec.user_authentication_required,
                },
            )?;
        }
        let replaced = entries
            .insert(
                spec.alias.clone(),
                Stored::PrivateKey {
                    key_pair,
                    entry: PrivateKeyEntry {
                        certificate: certificate.clone(),
                        user_authentication_required: spec.user_authentication_required,
                    },
                },
            )
            .is_some();
        drop(entries);

        info!(alias = %spec.alias, replaced, "Key pair generated");
        Ok(certificate)
    }

    fn entry(&self, alias: &str) -> Result<Option<Entry>, KeyStoreError> {
        Ok(self.read().get(alias).map(|stored| match stored {
            Stored::PrivateKey { entry, .. } => Entry::PrivateKey(entry.clone()),
            Stored::Certificate(certificate) => Entry::TrustedCertificate(certificate.clone()),
        }))
    }

    fn sign(
        &self,
        alias: &str,
        data: &[u8],
        authorization: Option<&UserAuthorization>,
    ) -> Result<Vec<u8>, KeyStoreError> {
        let entries = self.read();
        let (key_pair, entry) = match entries.get(alias) {
            Some(Stored::PrivateKey { key_pair, entry }) => (key_pair, entry),
            Some(Stored::Certificate(_)) => {
                return Err(KeyStoreError::NotAPrivateKey(alias.to_string()))
            }
            None => return Err(KeyStoreError::KeyNotFound(alias.to_string())),
        };

        if entry.user_authentication_required {
            let Some(authorization) = authorization else {
                return Err(KeyStoreError::UserNotAuthenticated);
            };
            debug!(alias, method = ?authorization.method(), "User authorization accepted");
        }

        let signature = key_pair
            .sign(&self.rng, data)
            .map_err(|_| KeyStoreError::Signing)?;
        Ok(signature.as_ref().to_vec())
    }

    fn set_certificate_entry(
        &self,
        alias: &str,
        certificate: Certificate,
    ) -> Result<(), KeyStoreError> {
        validate_alias(alias)?;
        let mut entries = self.write();
        if let Some(disk) = &self.disk {
            self.persist(
                disk,
                alias,
                &StoredFile::TrustedCertificate {
                    certificate: certificate.clone(),
                },
            )?;
        }
        entries.insert(alias.to_string(), Stored::Certificate(certificate));
        Ok(())
    }

    fn delete_entry(&self, alias: &str) -> Result<bool, KeyStoreError> {
        let mut entries = self.write();
        if let Some(disk) = &self.disk {
            if validate_alias(alias).is_ok() {
                match fs::remove_file(entry_path(&disk.dir, alias)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let removed = entries.remove(alias).is_some();
        drop(entries);

        if removed {
            info!(alias, "Key entry deleted");
        }
        Ok(removed)
    }
}

fn validate_alias(alias: &str) -> Result<(), KeyStoreError> {
    let valid = !alias.is_empty()
        && !alias.starts_with('.')
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidAlias(alias.to_string()))
    }
}

fn entry_path(dir: &Path, alias: &str) -> PathBuf {
    dir.join(format!("{alias}.json"))
}

/// Create `path` readable by the owner only. Fails if it already exists.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn read_or_create_salt(dir: &Path, rng: &SystemRandom) -> Result<Vec<u8>, KeyStoreError> {
    let path = dir.join(SALT_FILE);
    match fs::read(&path) {
        Ok(salt) if salt.len() == SALT_LEN => return Ok(salt),
        Ok(_) => {
            return Err(KeyStoreError::Storage(format!(
                "{} is not a {SALT_LEN}-byte salt",
                path.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut salt = vec![0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| KeyStoreError::Sealing("salt generation failed".to_string()))?;
    write_private(&path, &salt)?;
    Ok(salt)
}

fn load_entry(
    path: &Path,
    disk: &Disk,
    rng: &SystemRandom,
) -> Result<(String, Stored), KeyStoreError> {
    let json = fs::read(path)?;
    let file: StoredFile =
        serde_json::from_slice(&json).map_err(|e| KeyStoreError::Storage(e.to_string()))?;

    match file {
        StoredFile::PrivateKey {
            sealed,
            certificate,
            user_authentication_required,
        } => {
            validate_alias(&certificate.alias)?;
            let pkcs8 = disk.unseal(&certificate.alias, &sealed)?;
            let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8, rng)
                .map_err(|e| KeyStoreError::Storage(e.to_string()))?;
            if key_pair.public_key().as_ref() != certificate.public_key.as_slice() {
                return Err(KeyStoreError::Storage(
                    "certificate does not match private key".to_string(),
                ));
            }
            Ok((
                certificate.alias.clone(),
                Stored::PrivateKey {
                    key_pair,
                    entry: PrivateKeyEntry {
                        certificate,
                        user_authentication_required,
                    },
                },
            ))
        }
        StoredFile::TrustedCertificate { certificate } => {
            let alias = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| KeyStoreError::Storage("unreadable file name".to_string()))?
                .to_string();
            validate_alias(&alias)?;
            Ok((alias, Stored::Certificate(certificate)))
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
