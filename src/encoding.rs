/**
 * Encoding helpers
 * Binary fields travel as standard base64 strings in JSON
 */

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(input.trim())
}

/// Serde adapter for `Vec<u8>` fields: `#[serde(with = "crate::encoding::base64_bytes")]`.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
