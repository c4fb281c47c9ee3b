/**
 * Device Capabilities
 * What the host device offers for user authentication, and the
 * pre-flight checks run before a prompt is presented
 */

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub fingerprint_feature: bool,
    pub secure_lock_screen: bool,
    pub enrolled_fingerprints: bool,
    pub hardware_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BiometricUnavailable {
    #[error("device does not support the fingerprint feature")]
    FeatureMissing,
    #[error("no secure lock screen; set a PIN, pattern or password under Settings > Security")]
    NoSecureLockScreen,
    #[error("no fingerprint enrolled; add one under Settings > Security")]
    NotEnrolled,
    #[error("no fingerprint hardware detected")]
    NoHardware,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            fingerprint_feature: true,
            secure_lock_screen: true,
            enrolled_fingerprints: true,
            hardware_detected: true,
        }
    }
}

impl DeviceCapabilities {
    /// Checks run in a fixed order; the first failure wins.
    pub fn check_biometric(&self) -> Result<(), BiometricUnavailable> {
        if !self.fingerprint_feature {
            return Err(BiometricUnavailable::FeatureMissing);
        }
        if !self.secure_lock_screen {
            return Err(BiometricUnavailable::NoSecureLockScreen);
        }
        if !self.enrolled_fingerprints {
            return Err(BiometricUnavailable::NotEnrolled);
        }
        if !self.hardware_detected {
            return Err(BiometricUnavailable::NoHardware);
        }
        Ok(())
    }

    pub fn check_device_credential(&self) -> Result<(), BiometricUnavailable> {
        if !self.secure_lock_screen {
            return Err(BiometricUnavailable::NoSecureLockScreen);
        }
        Ok(())
    }
}
