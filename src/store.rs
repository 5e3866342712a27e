//! Durable keyed storage seam.
//!
//! The vault never chooses a database. It talks to a `VaultStore`, which
//! keeps encrypted payloads by item id and `KdfParameters` by scope key.
//! `MemoryStore` is the reference implementation used by tests and demos.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::envelope::EncryptedPayload;
use crate::error::StoreError;
use crate::keys::KdfParameters;
use crate::scope::ScopeKey;

/// Result of an upsert.
#[derive(Debug)]
pub struct UpsertOutcome {
    /// Revision assigned to the payload that was just written.
    pub revision: u64,
    /// The payload it replaced, if any.
    pub previous: Option<EncryptedPayload>,
}

/// A keyed store for payloads and KDF parameters.
///
/// Implementations own `EncryptedPayload::revision`: every successful write
/// assigns a strictly larger revision than the one it replaced. Reads must
/// return whole payloads, never a mix of two writes.
pub trait VaultStore: Send + Sync {
    fn get_payload(&self, item_id: &str) -> Result<Option<EncryptedPayload>, StoreError>;

    /// Insert or replace the payload stored under `payload.item_id`.
    fn upsert_payload(&self, payload: EncryptedPayload) -> Result<UpsertOutcome, StoreError>;

    /// Replace the payload only if its current revision is `expected_revision`.
    /// Returns `false` on a revision mismatch or a missing payload.
    fn compare_and_swap_payload(
        &self,
        expected_revision: u64,
        payload: EncryptedPayload,
    ) -> Result<bool, StoreError>;

    /// Remove the payload only if its current revision is `expected_revision`.
    fn remove_payload_if(&self, item_id: &str, expected_revision: u64) -> Result<bool, StoreError>;

    fn list_item_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Ids of payloads sealed under `scope`, sorted.
    fn list_item_ids_in_scope(&self, scope: &ScopeKey) -> Result<Vec<String>, StoreError>;

    fn get_kdf_parameters(&self, scope: &ScopeKey) -> Result<Option<KdfParameters>, StoreError>;

    /// Store `params` unless the scope already has parameters. Returns
    /// whichever parameters are stored afterwards. Existing parameters are
    /// never overwritten.
    fn insert_kdf_parameters_if_absent(
        &self,
        scope: &ScopeKey,
        params: KdfParameters,
    ) -> Result<KdfParameters, StoreError>;
}

/// In-memory `VaultStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    payloads: RwLock<HashMap<String, EncryptedPayload>>,
    kdf: RwLock<HashMap<ScopeKey, KdfParameters>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VaultStore for MemoryStore {
    fn get_payload(&self, item_id: &str) -> Result<Option<EncryptedPayload>, StoreError> {
        let payloads = self.payloads.read().map_err(|_| StoreError::Poisoned)?;
        Ok(payloads.get(item_id).cloned())
    }

    fn upsert_payload(&self, mut payload: EncryptedPayload) -> Result<UpsertOutcome, StoreError> {
        let mut payloads = self.payloads.write().map_err(|_| StoreError::Poisoned)?;
        let revision = payloads
            .get(&payload.item_id)
            .map_or(1, |current| current.revision + 1);
        payload.revision = revision;
        let previous = payloads.insert(payload.item_id.clone(), payload);
        Ok(UpsertOutcome { revision, previous })
    }

    fn compare_and_swap_payload(
        &self,
        expected_revision: u64,
        mut payload: EncryptedPayload,
    ) -> Result<bool, StoreError> {
        let mut payloads = self.payloads.write().map_err(|_| StoreError::Poisoned)?;
        match payloads.get_mut(&payload.item_id) {
            Some(current) if current.revision == expected_revision => {
                payload.revision = expected_revision + 1;
                *current = payload;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_payload_if(&self, item_id: &str, expected_revision: u64) -> Result<bool, StoreError> {
        let mut payloads = self.payloads.write().map_err(|_| StoreError::Poisoned)?;
        match payloads.get(item_id) {
            Some(current) if current.revision == expected_revision => {
                payloads.remove(item_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_item_ids(&self) -> Result<Vec<String>, StoreError> {
        let payloads = self.payloads.read().map_err(|_| StoreError::Poisoned)?;
        let mut ids: Vec<String> = payloads.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn list_item_ids_in_scope(&self, scope: &ScopeKey) -> Result<Vec<String>, StoreError> {
        let payloads = self.payloads.read().map_err(|_| StoreError::Poisoned)?;
        let mut ids: Vec<String> = payloads
            .values()
            .filter(|p| p.mode == scope.mode && p.subject_id == scope.identity)
            .map(|p| p.item_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn get_kdf_parameters(&self, scope: &ScopeKey) -> Result<Option<KdfParameters>, StoreError> {
        let kdf = self.kdf.read().map_err(|_| StoreError::Poisoned)?;
        Ok(kdf.get(scope).cloned())
    }

    fn insert_kdf_parameters_if_absent(
        &self,
        scope: &ScopeKey,
        params: KdfParameters,
    ) -> Result<KdfParameters, StoreError> {
        let mut kdf = self.kdf.write().map_err(|_| StoreError::Poisoned)?;
        Ok(kdf.entry(scope.clone()).or_insert(params).clone())
    }
}
