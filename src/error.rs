//! Error types for anamnesis-vault.
//!
//! Two layers of errors exist. `CryptoError` is the crate-internal failure
//! vocabulary of the AEAD and KDF primitives; it never crosses the public
//! boundary. `VaultError` is what callers see. Every decrypt-side
//! `CryptoError` collapses into `VaultError::AuthenticationFailure`, so a
//! caller cannot tell a wrong passphrase from a tampered payload.
//!
//! Error messages are intentionally minimal. They signal *what* failed
//! without revealing *why* in ways that could leak cryptographic state.

use thiserror::Error;

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Low-level cryptographic failures. Crate-internal detail only; it is
/// logged at `debug` level and then mapped to a `VaultError`.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum CryptoError {
    /// A key had the wrong length or was otherwise rejected by `ring`.
    #[error("invalid key")]
    InvalidKey,

    /// Sealing failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// Opening failed: wrong key, tampered ciphertext, or bad GCM tag.
    #[error("decryption failed")]
    DecryptionFailure,

    /// The payload binding tag did not verify.
    #[error("binding tag mismatch")]
    BindingMismatch,

    /// PBKDF2 or HKDF could not produce output.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// The payload names an administrator key generation the escrow does not hold.
    #[error("unknown escrow key generation")]
    UnknownEscrowKey,
}

/// Errors raised by a `VaultStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Errors raised by an `AuditSink` implementation.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit log lock poisoned")]
    Poisoned,
}

/// The single public error type for vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Empty passphrase, empty plaintext, or a missing scope identifier.
    /// Raised before any cryptographic work.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Any authenticated-decryption failure on either path. Covers wrong
    /// passphrase, corrupted wrap and tampered content alike.
    #[error("unable to decrypt")]
    AuthenticationFailure,

    /// No payload is stored for the item.
    #[error("no anamnesis stored for {0}")]
    NotFound(String),

    /// The audit sink refused the entry. The triggering operation was
    /// failed closed.
    #[error("audit unavailable")]
    AuditUnavailable,

    /// The permission collaborator denied the capability.
    #[error("permission denied")]
    PermissionDenied,

    /// Encryption-side failure. Generic on purpose.
    #[error("cryptographic operation failed")]
    Crypto,

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The payload was written by a newer or unknown schema.
    #[error("unsupported payload schema version {0}")]
    UnsupportedSchema(u16),

    /// A previous administrator key rotation has not completed yet.
    #[error("an administrator key rotation is still in progress")]
    RotationInProgress,

    /// A payload kept changing under a re-wrap until retries ran out.
    #[error("payload {0} kept changing during re-wrap")]
    RewrapConflict(String),

    /// `resume_admin_key_rotation` was called with nothing to resume.
    #[error("no administrator key rotation is pending")]
    NoRotationPending,

    /// The administrator KEK could not be loaded.
    #[error("administrator key source failed: {0}")]
    KeySource(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<AuditError> for VaultError {
    fn from(_: AuditError) -> Self {
        Self::AuditUnavailable
    }
}

impl VaultError {
    /// Map an internal failure on a decrypt path. All of them look the same
    /// from the outside.
    pub(crate) fn from_decrypt(_: CryptoError) -> Self {
        Self::AuthenticationFailure
    }

    /// Map an internal failure on an encrypt path.
    pub(crate) fn from_encrypt(_: CryptoError) -> Self {
        Self::Crypto
    }
}
