/**
 * Configuration
 * Read from AUTHDIALOG_* environment variables, with defaults for local runs
 */

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::device::DeviceCapabilities;
use crate::keystore::DEFAULT_ALIAS;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DEVICE_MODEL: &str = "authdialog-software-device";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub key_alias: String,
    pub keystore_dir: Option<PathBuf>,
    pub keystore_passphrase: Option<Passphrase>,
    pub device_model: String,
    pub device: DeviceCapabilities,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid socket address '{value}'")]
    BindAddr { var: &'static str, value: String },
    #[error("{var}: expected true/false, got '{value}'")]
    Flag { var: &'static str, value: String },
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
    #[error("AUTHDIALOG_KEYSTORE_PASSPHRASE is required when AUTHDIALOG_KEYSTORE_DIR is set")]
    MissingPassphrase,
}

/// Passphrase that seals persisted private keys. Wiped on drop, never printed.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            key_alias: DEFAULT_ALIAS.to_string(),
            keystore_dir: None,
            keystore_passphrase: None,
            device_model: DEFAULT_DEVICE_MODEL.to_string(),
            device: DeviceCapabilities::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_var = "AUTHDIALOG_BIND_ADDR";
        let bind = lookup(bind_var).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind.parse().map_err(|_| ConfigError::BindAddr {
            var: bind_var,
            value: bind.clone(),
        })?;

        let key_alias = lookup("AUTHDIALOG_KEY_ALIAS").unwrap_or_else(|| DEFAULT_ALIAS.to_string());
        if key_alias.trim().is_empty() {
            return Err(ConfigError::Empty {
                var: "AUTHDIALOG_KEY_ALIAS",
            });
        }

        let keystore_dir = lookup("AUTHDIALOG_KEYSTORE_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);
        let keystore_passphrase = lookup("AUTHDIALOG_KEYSTORE_PASSPHRASE")
            .filter(|passphrase| !passphrase.is_empty())
            .map(Passphrase::new);
        if keystore_dir.is_some() && keystore_passphrase.is_none() {
            return Err(ConfigError::MissingPassphrase);
        }

        let device_model = lookup("AUTHDIALOG_DEVICE_MODEL")
            .unwrap_or_else(|| DEFAULT_DEVICE_MODEL.to_string());

        let flag = |var: &'static str| -> Result<bool, ConfigError> {
            match lookup(var) {
                None => Ok(true),
                Some(value) => parse_flag(&value).ok_or(ConfigError::Flag { var, value }),
            }
        };
        let device = DeviceCapabilities {
            fingerprint_feature: flag("AUTHDIALOG_FINGERPRINT_FEATURE")?,
            secure_lock_screen: flag("AUTHDIALOG_SECURE_LOCK_SCREEN")?,
            enrolled_fingerprints: flag("AUTHDIALOG_ENROLLED_FINGERPRINTS")?,
            hardware_detected: flag("AUTHDIALOG_FINGERPRINT_HARDWARE")?,
        };

        Ok(Self {
            bind_addr,
            key_alias,
            keystore_dir,
            keystore_passphrase,
            device_model,
            device,
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
