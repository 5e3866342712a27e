//! Vault configuration.

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::keys::MIN_KDF_ITERATIONS;
use crate::mask::MaskConfig;

/// Deployment tunables for an `AnamnesisVault`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// PBKDF2 iterations for newly created scopes. Existing scopes keep
    /// the count they were created with.
    pub kdf_iterations: u32,

    /// Masked preview shape.
    pub mask: MaskConfig,

    /// Compare-and-swap retries per payload during admin key rotation.
    pub rotation_max_retries: u32,

    /// Environment variable read by `EnvKekSource` at startup.
    pub admin_kek_env: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            mask: MaskConfig::default(),
            rotation_max_retries: 3,
            admin_kek_env: "ANAMNESIS_ADMIN_KEK".to_string(),
        }
    }
}

impl VaultConfig {
    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> VaultResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(VaultError::Config(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        if self.mask.length_bucket == 0 {
            return Err(VaultError::Config("mask.length_bucket must be non-zero".into()));
        }
        if self.admin_kek_env.is_empty() {
            return Err(VaultError::Config("admin_kek_env must be set".into()));
        }
        Ok(())
    }
}
