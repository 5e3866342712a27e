//! Key derivation and ownership.
//!
//! This module owns three responsibilities:
//! 1. Stretching a passphrase into a user-path wrap key with PBKDF2-HMAC-SHA256.
//! 2. Deriving the payload binding key from a data key with HKDF-SHA256.
//! 3. Holding key material in types that are opaque, non-cloneable and
//!    zeroised on drop.
//!
//! ## Passphrase stretching
//!
//! ```text
//! PBKDF2-HMAC-SHA256(
//!     password   = passphrase,
//!     salt       = KdfParameters.salt       (128 bits, one per scope),
//!     iterations = KdfParameters.iterations (>= MIN_KDF_ITERATIONS),
//! ) -> 256-bit wrap key
//! ```
//!
//! Derivation never judges the passphrase. A wrong passphrase yields a
//! well-formed but useless key, and only the later AEAD check notices.

use std::fmt;
use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use ring::{hkdf, hmac, pbkdf2};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::error::CryptoError;

/// Salt length for passphrase stretching (128 bits).
pub const SALT_LEN: usize = 16;

/// Iteration floor. New salts never go below it; stored parameters are
/// never rewritten.
pub const MIN_KDF_ITERATIONS: u32 = 150_000;

const BINDING_INFO: &[u8] = b"anamnesis-binding-v1";

// ---------------------------------------------------------------------------
// KDF parameters
// ---------------------------------------------------------------------------

/// Stretching parameters persisted once per `(mode, scope identity)`.
///
/// Immutable after creation. Raising the iteration count only affects
/// parameters created afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParameters {
    pub salt: [u8; SALT_LEN],
    pub iterations: u32,
    pub created_at: DateTime<Utc>,
}

impl KdfParameters {
    /// Fresh parameters with a random salt. `iterations` is raised to the
    /// floor if it is lower.
    pub(crate) fn generate(iterations: u32) -> Result<Self, CryptoError> {
        Ok(Self {
            salt: crypto::random_array()?,
            iterations: iterations.max(MIN_KDF_ITERATIONS),
            created_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Key types
// ---------------------------------------------------------------------------

/// A per-item data encryption key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub(crate) fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: crypto::random_array()?,
        })
    }

    /// Rebuild a data key from unwrapped bytes.
    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// A passphrase-derived key whose only job is wrapping a `DataKey`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct WrapKey {
    bytes: [u8; KEY_LEN],
}

impl WrapKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// The administrator key-encryption-key.
///
/// - Not `Clone`.
/// - Zeroised on drop.
/// - `Debug` never prints the bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AdminKek {
    bytes: [u8; KEY_LEN],
}

impl AdminKek {
    /// Construct an `AdminKek` from raw bytes. In production the bytes come
    /// from a `KekSource`.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub(crate) fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: crypto::random_array()?,
        })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for AdminKek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminKek([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Stretch `passphrase` into a wrap key.
///
/// A zero iteration count, which only a corrupted payload can carry, is a
/// derivation failure.
pub(crate) fn derive_wrap_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Result<WrapKey, CryptoError> {
    let iterations = NonZeroU32::new(iterations).ok_or(CryptoError::KeyDerivationFailure)?;

    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut out,
    );

    let key = WrapKey { bytes: out };
    out.zeroize();
    Ok(key)
}

/// Derive the HMAC key that binds every field of a payload to its data key.
///
/// ```text
/// HKDF-SHA256(ikm = DEK, salt = empty, info = "anamnesis-binding-v1")
/// ```
pub(crate) fn derive_binding_key(dek: &DataKey) -> Result<hmac::Key, CryptoError> {
    // An empty salt is treated by HKDF as a zero-filled salt of hash length.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(dek.as_bytes());

    let info = [BINDING_INFO];
    let okm = prk
        .expand(&info, hmac::HMAC_SHA256)
        .map_err(|_| CryptoError::KeyDerivationFailure)?;

    Ok(hmac::Key::from(okm))
}
