//! Administrator escrow.
//!
//! The escrow holds the administrator key-encryption-key in memory and is
//! the only component able to open `wrapped_key_admin`. It never sees a
//! passphrase.
//!
//! Keys are tracked as numbered generations. Outside a rotation only the
//! current generation exists. During a rotation the previous generation is
//! kept as well, so payloads not yet re-wrapped stay readable:
//!
//! ```text
//! steady:    current = g(n)
//! rotating:  current = g(n+1), previous = g(n)
//! finished:  current = g(n+1)
//! ```

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, KEY_LEN};
use crate::envelope::WrappedKey;
use crate::error::{CryptoError, VaultError, VaultResult};
use crate::keys::{AdminKek, DataKey};

// ---------------------------------------------------------------------------
// Key source
// ---------------------------------------------------------------------------

/// A startup-time source of the administrator KEK.
pub trait KekSource {
    fn load(&self) -> VaultResult<AdminKek>;
}

/// Reads a base64-encoded 32-byte KEK from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvKekSource {
    var: String,
}

impl EnvKekSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl KekSource for EnvKekSource {
    fn load(&self) -> VaultResult<AdminKek> {
        let encoded = Zeroizing::new(
            std::env::var(&self.var)
                .map_err(|_| VaultError::KeySource(format!("{} is not set", self.var)))?,
        );
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| VaultError::KeySource(format!("{} is not valid base64", self.var)))?,
        );
        let mut bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            VaultError::KeySource(format!("{} must decode to {KEY_LEN} bytes", self.var))
        })?;

        let kek = AdminKek::from_bytes(bytes);
        bytes.zeroize();
        Ok(kek)
    }
}

// ---------------------------------------------------------------------------
// Grant
// ---------------------------------------------------------------------------

/// Proof that the permission collaborator allowed an escrow unwrap.
///
/// Only the crate can mint one, and only after a successful
/// `DecryptAsAdmin` check or inside an operator-initiated rotation.
#[derive(Debug)]
pub struct EscrowGrant {
    _private: (),
}

impl EscrowGrant {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

// ---------------------------------------------------------------------------
// Escrow
// ---------------------------------------------------------------------------

struct Generation {
    id: u32,
    kek: Arc<AdminKek>,
}

struct KeyRing {
    current: Generation,
    previous: Option<Generation>,
}

/// Process-wide holder of the administrator KEK.
pub struct AdminEscrow {
    ring: RwLock<KeyRing>,
}

impl std::fmt::Debug for AdminEscrow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.read_ring();
        f.debug_struct("AdminEscrow")
            .field("current_key_id", &ring.current.id)
            .field("previous_key_id", &ring.previous.as_ref().map(|g| g.id))
            .finish()
    }
}

fn admin_wrap_aad(item_id: &str, key_id: u32) -> Vec<u8> {
    format!("anamnesis-dek|admin|{item_id}|{key_id}").into_bytes()
}

impl AdminEscrow {
    /// Hold `kek` as generation 1.
    pub fn new(kek: AdminKek) -> Self {
        Self::with_key_id(kek, 1)
    }

    /// Hold `kek` as a specific generation. Use the generation persisted
    /// payloads were last rotated to.
    pub fn with_key_id(kek: AdminKek, key_id: u32) -> Self {
        Self {
            ring: RwLock::new(KeyRing {
                current: Generation {
                    id: key_id,
                    kek: Arc::new(kek),
                },
                previous: None,
            }),
        }
    }

    pub fn from_source(source: &dyn KekSource, key_id: u32) -> VaultResult<Self> {
        Ok(Self::with_key_id(source.load()?, key_id))
    }

    /// Rebuild the escrow of a rotation that did not finish before the
    /// process stopped.
    ///
    /// Both generations are held, as `begin_rotation` left them, so
    /// `AnamnesisVault::resume_admin_key_rotation` can move the remaining
    /// payloads. `previous` and `current` are `(kek, generation)` pairs and
    /// must name different generations.
    pub fn resuming(previous: (AdminKek, u32), current: (AdminKek, u32)) -> VaultResult<Self> {
        let (previous_kek, from) = previous;
        let (current_kek, to) = current;
        if from == to {
            return Err(VaultError::Config(format!(
                "pending rotation needs two generations, got {from} twice"
            )));
        }
        tracing::info!(from, to, "administrator escrow restored mid-rotation");
        Ok(Self {
            ring: RwLock::new(KeyRing {
                current: Generation {
                    id: to,
                    kek: Arc::new(current_kek),
                },
                previous: Some(Generation {
                    id: from,
                    kek: Arc::new(previous_kek),
                }),
            }),
        })
    }

    /// `resuming` with both keys loaded from sources.
    pub fn resuming_from_sources(
        previous: (&dyn KekSource, u32),
        current: (&dyn KekSource, u32),
    ) -> VaultResult<Self> {
        Self::resuming((previous.0.load()?, previous.1), (current.0.load()?, current.1))
    }

    // The ring is only ever replaced by whole assignments, so a poisoned
    // lock still guards a consistent value.
    fn read_ring(&self) -> RwLockReadGuard<'_, KeyRing> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_ring(&self) -> RwLockWriteGuard<'_, KeyRing> {
        self.ring.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_key_id(&self) -> u32 {
        self.read_ring().current.id
    }

    /// `(from, to)` generations of an unfinished rotation.
    pub fn pending_rotation(&self) -> Option<(u32, u32)> {
        let ring = self.read_ring();
        ring.previous.as_ref().map(|prev| (prev.id, ring.current.id))
    }

    fn kek_for(&self, key_id: u32) -> Option<Arc<AdminKek>> {
        let ring = self.read_ring();
        if ring.current.id == key_id {
            return Some(Arc::clone(&ring.current.kek));
        }
        ring.previous
            .as_ref()
            .filter(|prev| prev.id == key_id)
            .map(|prev| Arc::clone(&prev.kek))
    }

    /// Seal `dek` under the current generation.
    pub(crate) fn wrap_dek(
        &self,
        dek: &DataKey,
        item_id: &str,
    ) -> Result<(u32, WrappedKey), CryptoError> {
        let (key_id, kek) = {
            let ring = self.read_ring();
            (ring.current.id, Arc::clone(&ring.current.kek))
        };
        let sealed = crypto::seal(kek.as_bytes(), dek.as_bytes(), &admin_wrap_aad(item_id, key_id))?;
        Ok((
            key_id,
            WrappedKey {
                iv: sealed.nonce,
                bytes: sealed.ciphertext,
            },
        ))
    }

    /// Open an admin-path wrapped key sealed under generation `key_id`.
    pub(crate) fn unwrap_dek(
        &self,
        _grant: &EscrowGrant,
        key_id: u32,
        wrapped: &WrappedKey,
        item_id: &str,
    ) -> Result<DataKey, CryptoError> {
        let kek = self.kek_for(key_id).ok_or(CryptoError::UnknownEscrowKey)?;
        let raw = crypto::open(
            kek.as_bytes(),
            &wrapped.iv,
            &wrapped.bytes,
            &admin_wrap_aad(item_id, key_id),
        )?;
        DataKey::from_slice(&raw)
    }

    /// Install `kek` as the next generation and keep the old one for
    /// unwrapping until `finish_rotation`.
    pub(crate) fn begin_rotation(&self, kek: AdminKek) -> VaultResult<(u32, u32)> {
        let mut ring = self.write_ring();
        if ring.previous.is_some() {
            return Err(VaultError::RotationInProgress);
        }
        let to = ring
            .current
            .id
            .checked_add(1)
            .ok_or_else(|| VaultError::Config("administrator key generations exhausted".into()))?;

        let old = std::mem::replace(
            &mut ring.current,
            Generation {
                id: to,
                kek: Arc::new(kek),
            },
        );
        let from = old.id;
        ring.previous = Some(old);

        tracing::info!(from, to, "administrator key rotation started");
        Ok((from, to))
    }

    /// Drop the previous generation. Its bytes are zeroised once the last
    /// in-flight user releases it.
    pub(crate) fn finish_rotation(&self) {
        let mut ring = self.write_ring();
        if let Some(prev) = ring.previous.take() {
            tracing::info!(
                from = prev.id,
                to = ring.current.id,
                "administrator key rotation finished"
            );
        }
    }
}
