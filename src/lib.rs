//! # anamnesis-vault
//!
//! Encrypted storage for clinical anamnesis text with two independent ways
//! back to the plaintext.
//!
//! Every item is sealed under its own random data key (DEK). The DEK is
//! wrapped twice:
//!
//! - under a key stretched from the data subject's passphrase (user path)
//! - under an administrator key-encryption-key held by the escrow (admin path)
//!
//! Which passphrase salt an item shares with its neighbours is decided by a
//! deployment-selected scope mode: per record, per patient or per clinic.
//! Every access attempt produces an audit entry, and an unavailable audit
//! sink makes the attempt fail closed.
//!
//! ## Public API
//!
//! `AnamnesisVault` is the entry point. Storage, permission checks and
//! audit recording are injected through the `VaultStore`,
//! `PermissionChecker` and `AuditSink` traits. Key material types are
//! opaque; the raw crypto layer is `pub(crate)`.

pub mod access;
pub mod audit;
pub mod config;
pub(crate) mod crypto;
pub(crate) mod envelope;
pub mod error;
pub mod escrow;
pub(crate) mod keys;
pub mod mask;
pub mod scope;
pub mod store;
pub mod vault;

pub use access::{Capability, Decision, PermissionChecker};
pub use audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome, AuditSink, FailureReason, FileAuditSink};
pub use config::VaultConfig;
pub use crypto::KEY_LEN;
pub use envelope::{EncryptedPayload, WrappedKey, SCHEMA_VERSION};
pub use error::{VaultError, VaultResult};
pub use escrow::{AdminEscrow, EnvKekSource, KekSource};
pub use keys::{AdminKek, KdfParameters, MIN_KDF_ITERATIONS, SALT_LEN};
pub use mask::{MaskConfig, MaskedPreview};
pub use scope::{ScopeKey, ScopeMode, SubjectRef};
pub use store::{MemoryStore, VaultStore};
pub use vault::{AnamnesisVault, RotationReport, WriteAck};

/// Generate a fresh administrator KEK.
///
/// Intended for provisioning and tests. In production the KEK is created
/// once, stored in a secret manager and loaded through a `KekSource`.
pub fn generate_admin_kek() -> Result<AdminKek, VaultError> {
    AdminKek::generate().map_err(VaultError::from_encrypt)
}
