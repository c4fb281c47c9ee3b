/**
 * authdialog
 * Attested signing key behind user authentication prompts:
 * fingerprint, device credential and confirmation dialogs, plus a
 * single-alias key slot that signs only after the user authenticates
 */

pub mod attestation;
pub mod config;
pub mod device;
pub mod encoding;
pub mod http;
pub mod keystore;
pub mod prompt;
pub mod signer;

pub use config::Config;
pub use http::{router, AppState};
pub use signer::{KeystoreSigner, SignerError};
