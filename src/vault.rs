//! The vault service.
//!
//! `AnamnesisVault` is the only public way to write or read anamnesis
//! content. Every write, masked preview and decrypt attempt goes through
//! the same three steps:
//!
//! 1. Ask the permission collaborator.
//! 2. Do the cryptographic work.
//! 3. Record exactly one audit entry describing what actually happened.
//!
//! If step 3 fails, the operation fails closed. Plaintext is dropped, and
//! so zeroised, and a write is rolled back.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use zeroize::Zeroizing;

use crate::access::{Capability, Decision, PermissionChecker};
use crate::audit::{AuditAction, AuditEntry, AuditSink, FailureReason};
use crate::config::VaultConfig;
use crate::envelope::{self, EncryptedPayload, SealRequest, SCHEMA_VERSION};
use crate::error::{CryptoError, VaultError, VaultResult};
use crate::escrow::{AdminEscrow, EscrowGrant};
use crate::keys::{self, AdminKek, KdfParameters, WrapKey};
use crate::mask::{self, MaskedPreview};
use crate::scope::{self, ScopeKey, ScopeMode, ScopeResolver, SubjectRef};
use crate::store::VaultStore;

/// Acknowledgement of a persisted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub item_id: String,
    pub mode: ScopeMode,
    pub revision: u64,
    pub admin_key_id: u32,
}

/// Outcome of an administrator key rotation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub from_key_id: u32,
    pub to_key_id: u32,
    /// Payloads moved to the new key by this pass.
    pub rewrapped: usize,
    /// Payloads that were already under the new key.
    pub already_current: usize,
    /// Items that could not be re-wrapped. The previous key is retained
    /// while this is non-empty.
    pub failed: Vec<String>,
}

impl RotationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Whether a write into a shared scope must first prove it holds the
/// scope's passphrase.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeCheck {
    Verify,
    Skip,
}

enum RewrapStep {
    Rewrapped,
    AlreadyCurrent,
    Gone,
}

fn failure_reason(err: &VaultError) -> FailureReason {
    match err {
        VaultError::InvalidInput(_) => FailureReason::InvalidInput,
        VaultError::PermissionDenied => FailureReason::PermissionDenied,
        VaultError::NotFound(_) => FailureReason::NotFound,
        VaultError::AuthenticationFailure => FailureReason::AuthenticationFailure,
        VaultError::Crypto => FailureReason::CryptoFailure,
        VaultError::Storage(_) => FailureReason::StorageFailure,
        VaultError::UnsupportedSchema(_) => FailureReason::UnsupportedSchema,
        VaultError::AuditUnavailable
        | VaultError::RotationInProgress
        | VaultError::RewrapConflict(_)
        | VaultError::NoRotationPending
        | VaultError::KeySource(_)
        | VaultError::Config(_) => FailureReason::Internal,
    }
}

fn into_text(bytes: Zeroizing<Vec<u8>>) -> VaultResult<Zeroizing<String>> {
    let text = std::str::from_utf8(&bytes).map_err(|_| VaultError::AuthenticationFailure)?;
    Ok(Zeroizing::new(text.to_owned()))
}

/// Encrypted anamnesis storage with a passphrase path and an escrow path.
pub struct AnamnesisVault {
    config: VaultConfig,
    escrow: AdminEscrow,
    store: Arc<dyn VaultStore>,
    resolver: ScopeResolver,
    permissions: Arc<dyn PermissionChecker>,
    audit: Arc<dyn AuditSink>,
    /// Held shared by writes and escrow reads, and exclusively by the
    /// closing phase of a rotation. A retiring key is never dropped while
    /// something still seals under it or reads through it.
    rotation_gate: RwLock<()>,
}

impl std::fmt::Debug for AnamnesisVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnamnesisVault")
            .field("config", &self.config)
            .field("escrow", &self.escrow)
            .finish_non_exhaustive()
    }
}

impl AnamnesisVault {
    pub fn new(
        config: VaultConfig,
        escrow: AdminEscrow,
        store: Arc<dyn VaultStore>,
        permissions: Arc<dyn PermissionChecker>,
        audit: Arc<dyn AuditSink>,
    ) -> VaultResult<Self> {
        config.validate()?;
        let resolver = ScopeResolver::new(Arc::clone(&store), config.kdf_iterations);
        Ok(Self {
            config,
            escrow,
            store,
            resolver,
            permissions,
            audit,
            rotation_gate: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn escrow(&self) -> &AdminEscrow {
        &self.escrow
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn record(&self, entry: AuditEntry) -> VaultResult<()> {
        self.audit.append(&entry).map_err(|e| {
            tracing::error!(
                action = ?entry.action,
                item_id = %entry.subject_id,
                error = %e,
                "audit append failed, failing closed"
            );
            VaultError::from(e)
        })
    }

    /// Record the failure and hand back `err`, unless recording fails too.
    fn reject<T>(
        &self,
        action: AuditAction,
        actor_id: &str,
        item_id: &str,
        err: VaultError,
    ) -> VaultResult<T> {
        let reason = failure_reason(&err);
        self.record(AuditEntry::failure(action, actor_id, item_id, reason))?;
        Err(err)
    }

    fn authorize(&self, actor_id: &str, capability: Capability, item_id: &str) -> VaultResult<()> {
        match self.permissions.check(actor_id, capability, item_id) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                tracing::warn!(actor = %actor_id, %capability, item_id = %item_id, "permission denied");
                Err(VaultError::PermissionDenied)
            }
        }
    }

    fn load(&self, item_id: &str) -> VaultResult<EncryptedPayload> {
        let payload = self
            .store
            .get_payload(item_id)?
            .ok_or_else(|| VaultError::NotFound(item_id.to_string()))?;
        if payload.schema_version != SCHEMA_VERSION {
            return Err(VaultError::UnsupportedSchema(payload.schema_version));
        }
        Ok(payload)
    }

    fn decrypt_failed(path: &'static str, item_id: &str, err: CryptoError) -> VaultError {
        tracing::debug!(path, item_id = %item_id, detail = %err, "decrypt failed");
        VaultError::from_decrypt(err)
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Encrypt `plaintext` for `subject.record_id`, replacing any earlier
    /// payload for that item.
    ///
    /// Patient and clinic scopes have one passphrase. Writing into such a
    /// scope with a passphrase that does not open an existing item of the
    /// scope fails with `AuthenticationFailure`.
    pub fn write(
        &self,
        actor_id: &str,
        subject: &SubjectRef,
        mode: ScopeMode,
        plaintext: &str,
        passphrase: &str,
    ) -> VaultResult<WriteAck> {
        self.write_with(actor_id, subject, mode, plaintext, passphrase, ScopeCheck::Verify)
    }

    fn write_with(
        &self,
        actor_id: &str,
        subject: &SubjectRef,
        mode: ScopeMode,
        plaintext: &str,
        passphrase: &str,
        check: ScopeCheck,
    ) -> VaultResult<WriteAck> {
        let item_id = subject.record_id.as_str();
        let _gate = self.rotation_gate.read().unwrap_or_else(PoisonError::into_inner);

        let (ack, previous) = match self.try_write(actor_id, subject, mode, plaintext, passphrase, check) {
            Ok(written) => written,
            Err(err) => return self.reject(AuditAction::Write, actor_id, item_id, err),
        };

        if let Err(err) = self.record(AuditEntry::success(AuditAction::Write, actor_id, item_id)) {
            self.roll_back_write(&ack, previous);
            return Err(err);
        }

        tracing::info!(
            actor = %actor_id,
            item_id = %item_id,
            mode = %mode,
            revision = ack.revision,
            "anamnesis written"
        );
        Ok(ack)
    }

    fn try_write(
        &self,
        actor_id: &str,
        subject: &SubjectRef,
        mode: ScopeMode,
        plaintext: &str,
        passphrase: &str,
        check: ScopeCheck,
    ) -> VaultResult<(WriteAck, Option<EncryptedPayload>)> {
        let item_id = subject.record_id.as_str();
        if item_id.is_empty() {
            return Err(VaultError::InvalidInput("missing record id"));
        }
        if plaintext.is_empty() {
            return Err(VaultError::InvalidInput("empty plaintext"));
        }
        if passphrase.is_empty() {
            return Err(VaultError::InvalidInput("empty passphrase"));
        }
        self.authorize(actor_id, Capability::Write, item_id)?;

        let scope = scope::resolve(mode, subject)?;
        let params = self.resolver.parameters_for(&scope)?;
        let wrap_key = keys::derive_wrap_key(passphrase, &params.salt, params.iterations)
            .map_err(VaultError::from_encrypt)?;
        if check == ScopeCheck::Verify {
            self.verify_scope_passphrase(item_id, &scope, &params, &wrap_key)?;
        }

        let request = SealRequest {
            item_id,
            scope: &scope,
            params: &params,
            wrap_key: &wrap_key,
            plaintext: plaintext.as_bytes(),
        };
        let payload = envelope::encrypt(&request, &self.escrow).map_err(|e| {
            tracing::debug!(item_id = %item_id, detail = %e, "seal failed");
            VaultError::from_encrypt(e)
        })?;

        let admin_key_id = payload.admin_key_id;
        let outcome = self.store.upsert_payload(payload)?;
        let ack = WriteAck {
            item_id: item_id.to_string(),
            mode,
            revision: outcome.revision,
            admin_key_id,
        };
        Ok((ack, outcome.previous))
    }

    /// Trial-unwrap one other item of a shared scope with `wrap_key`.
    ///
    /// Items whose stored parameters differ from the scope's are not
    /// comparable and are passed over.
    fn verify_scope_passphrase(
        &self,
        item_id: &str,
        scope: &ScopeKey,
        params: &KdfParameters,
        wrap_key: &WrapKey,
    ) -> VaultResult<()> {
        if scope.mode == ScopeMode::Record {
            return Ok(());
        }
        for sibling_id in self.store.list_item_ids_in_scope(scope)? {
            if sibling_id == item_id {
                continue;
            }
            let Some(sibling) = self.store.get_payload(&sibling_id)? else {
                continue;
            };
            if sibling.kdf_salt != params.salt || sibling.kdf_iterations != params.iterations {
                continue;
            }
            return envelope::user_wrap_opens(&sibling, wrap_key).map_err(|e| {
                tracing::warn!(
                    item_id = %item_id,
                    mode = %scope.mode,
                    "passphrase does not match the shared scope"
                );
                Self::decrypt_failed("scope", item_id, e)
            });
        }
        Ok(())
    }

    /// Undo a persisted write whose audit entry could not be recorded.
    ///
    /// The conditional restore is tried twice. If the store fails both
    /// times the unaudited payload stays persisted and the write is not
    /// all-or-nothing; the caller still gets `AuditUnavailable` and the
    /// event is logged at `error`.
    fn roll_back_write(&self, ack: &WriteAck, previous: Option<EncryptedPayload>) {
        for attempt in 1..=2u32 {
            let restored = match &previous {
                Some(previous) => self
                    .store
                    .compare_and_swap_payload(ack.revision, previous.clone()),
                None => self.store.remove_payload_if(&ack.item_id, ack.revision),
            };
            match restored {
                Ok(true) => {
                    tracing::warn!(item_id = %ack.item_id, "unaudited write rolled back");
                    return;
                }
                Ok(false) => {
                    tracing::warn!(
                        item_id = %ack.item_id,
                        "unaudited write already superseded, nothing to roll back"
                    );
                    return;
                }
                Err(e) => tracing::error!(
                    item_id = %ack.item_id,
                    attempt,
                    error = %e,
                    "rollback of unaudited write failed"
                ),
            }
        }
        tracing::error!(item_id = %ack.item_id, "unaudited write left in place");
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Existence and approximate size, without decrypting.
    pub fn preview_masked(&self, actor_id: &str, item_id: &str) -> VaultResult<MaskedPreview> {
        let loaded = self
            .authorize(actor_id, Capability::Read, item_id)
            .and_then(|()| self.store.get_payload(item_id).map_err(VaultError::from));

        match loaded {
            Ok(payload) => {
                let preview = mask::preview(payload.as_ref(), &self.config.mask);
                self.record(AuditEntry::success(AuditAction::ReadMasked, actor_id, item_id))?;
                Ok(preview)
            }
            Err(err) => self.reject(AuditAction::ReadMasked, actor_id, item_id, err),
        }
    }

    /// Decrypt with the data subject's passphrase.
    ///
    /// Any failure to unwrap or open is `AuthenticationFailure`, whatever
    /// the cause.
    pub fn decrypt_as_user(
        &self,
        actor_id: &str,
        item_id: &str,
        passphrase: &str,
    ) -> VaultResult<Zeroizing<String>> {
        match self.try_decrypt_user(actor_id, item_id, passphrase) {
            Ok(plaintext) => {
                self.record(AuditEntry::success(AuditAction::DecryptUser, actor_id, item_id))?;
                Ok(plaintext)
            }
            Err(err) => {
                tracing::warn!(actor = %actor_id, item_id = %item_id, error = %err, "user-path decrypt refused");
                self.reject(AuditAction::DecryptUser, actor_id, item_id, err)
            }
        }
    }

    fn try_decrypt_user(
        &self,
        actor_id: &str,
        item_id: &str,
        passphrase: &str,
    ) -> VaultResult<Zeroizing<String>> {
        if passphrase.is_empty() {
            return Err(VaultError::InvalidInput("empty passphrase"));
        }
        self.authorize(actor_id, Capability::DecryptAsUser, item_id)?;
        let payload = self.load(item_id)?;
        let bytes = envelope::decrypt_user_path(&payload, passphrase)
            .map_err(|e| Self::decrypt_failed("user", item_id, e))?;
        into_text(bytes)
    }

    /// Decrypt through the escrow. Takes no passphrase; requires the
    /// `DecryptAsAdmin` capability.
    pub fn decrypt_as_admin(&self, actor_id: &str, item_id: &str) -> VaultResult<Zeroizing<String>> {
        match self.try_decrypt_admin(actor_id, item_id) {
            Ok(plaintext) => {
                self.record(AuditEntry::success(AuditAction::DecryptAdmin, actor_id, item_id))?;
                tracing::info!(actor = %actor_id, item_id = %item_id, "escrow decrypt granted");
                Ok(plaintext)
            }
            Err(err) => {
                tracing::warn!(actor = %actor_id, item_id = %item_id, error = %err, "escrow decrypt refused");
                self.reject(AuditAction::DecryptAdmin, actor_id, item_id, err)
            }
        }
    }

    fn try_decrypt_admin(&self, actor_id: &str, item_id: &str) -> VaultResult<Zeroizing<String>> {
        self.authorize(actor_id, Capability::DecryptAsAdmin, item_id)?;
        let grant = EscrowGrant::new();
        let _gate = self.rotation_gate.read().unwrap_or_else(PoisonError::into_inner);
        let payload = self.load(item_id)?;
        let bytes = envelope::decrypt_admin_path(&payload, &self.escrow, &grant)
            .map_err(|e| Self::decrypt_failed("admin", item_id, e))?;
        into_text(bytes)
    }

    // -----------------------------------------------------------------------
    // Passphrase change
    // -----------------------------------------------------------------------

    /// Move the scope of `item_id` to a new passphrase.
    ///
    /// A record scope holds only `item_id`. Patient and clinic scopes share
    /// one passphrase, so every item of the scope is re-encrypted. Each item
    /// gets a fresh data key and is audited as a `decrypt_user` followed by
    /// a `write`. The scope's stored KDF parameters are reused unchanged.
    ///
    /// Every item is decrypted before the first write, so a wrong old
    /// passphrase or a damaged item changes nothing. If a write fails part
    /// way, the error is returned; items already written open under the new
    /// passphrase and the rest still open under the old one.
    pub fn change_passphrase(
        &self,
        actor_id: &str,
        item_id: &str,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> VaultResult<Vec<WriteAck>> {
        if new_passphrase.is_empty() {
            return Err(VaultError::InvalidInput("empty passphrase"));
        }
        let first = self.decrypt_as_user(actor_id, item_id, old_passphrase)?;
        let payload = self.load(item_id)?;
        let scope = ScopeKey {
            mode: payload.mode,
            identity: payload.subject_id,
        };

        let mut plaintexts = vec![(item_id.to_string(), first)];
        if scope.mode != ScopeMode::Record {
            for sibling_id in self.store.list_item_ids_in_scope(&scope)? {
                if sibling_id != item_id {
                    let text = self.decrypt_as_user(actor_id, &sibling_id, old_passphrase)?;
                    plaintexts.push((sibling_id, text));
                }
            }
        }

        let mut acks = Vec::with_capacity(plaintexts.len());
        for (id, text) in &plaintexts {
            let subject = SubjectRef::for_scope(id, &scope);
            acks.push(self.write_with(
                actor_id,
                &subject,
                scope.mode,
                text,
                new_passphrase,
                ScopeCheck::Skip,
            )?);
        }

        tracing::info!(
            actor = %actor_id,
            item_id = %item_id,
            mode = %scope.mode,
            items = acks.len(),
            "passphrase changed"
        );
        Ok(acks)
    }

    // -----------------------------------------------------------------------
    // Administrator key rotation
    // -----------------------------------------------------------------------

    /// Move every payload's admin wrap to `new_kek`.
    ///
    /// Content ciphertext and user wraps are untouched. If some payloads
    /// fail, the report lists them, the previous key stays loaded, and
    /// `resume_admin_key_rotation` picks up where this left off.
    pub fn rotate_admin_key(&self, new_kek: AdminKek) -> VaultResult<RotationReport> {
        let (from, to) = self.escrow.begin_rotation(new_kek)?;
        self.run_rotation(from, to)
    }

    /// Continue an interrupted rotation.
    pub fn resume_admin_key_rotation(&self) -> VaultResult<RotationReport> {
        let (from, to) = self
            .escrow
            .pending_rotation()
            .ok_or(VaultError::NoRotationPending)?;
        self.run_rotation(from, to)
    }

    fn run_rotation(&self, from: u32, to: u32) -> VaultResult<RotationReport> {
        let grant = EscrowGrant::new();
        let mut report = RotationReport {
            from_key_id: from,
            to_key_id: to,
            ..RotationReport::default()
        };

        for item_id in self.store.list_item_ids()? {
            match self.rewrap_item(&item_id, to, &grant) {
                Ok(RewrapStep::Rewrapped) => report.rewrapped += 1,
                Ok(RewrapStep::AlreadyCurrent) => report.already_current += 1,
                Ok(RewrapStep::Gone) => {}
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %e, "admin re-wrap failed");
                    report.failed.push(item_id);
                }
            }
        }

        // Sweep for payloads written under the old key while the first pass
        // ran. No write or escrow read is in flight while the gate is held.
        let _gate = self.rotation_gate.write().unwrap_or_else(PoisonError::into_inner);
        for item_id in self.store.list_item_ids()? {
            if report.failed.contains(&item_id) {
                continue;
            }
            match self.rewrap_item(&item_id, to, &grant) {
                Ok(RewrapStep::Rewrapped) => report.rewrapped += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %e, "admin re-wrap failed");
                    report.failed.push(item_id);
                }
            }
        }

        if report.is_complete() {
            self.escrow.finish_rotation();
        }
        tracing::info!(
            from,
            to,
            rewrapped = report.rewrapped,
            already_current = report.already_current,
            failed = report.failed.len(),
            "administrator key rotation pass finished"
        );
        Ok(report)
    }

    /// Re-wrap one payload. Read, re-wrap and compare-and-swap form one
    /// retryable unit; a lost race re-reads the payload.
    fn rewrap_item(&self, item_id: &str, to: u32, grant: &EscrowGrant) -> VaultResult<RewrapStep> {
        for _ in 0..=self.config.rotation_max_retries {
            let Some(payload) = self.store.get_payload(item_id)? else {
                return Ok(RewrapStep::Gone);
            };
            if payload.admin_key_id == to {
                return Ok(RewrapStep::AlreadyCurrent);
            }

            let next = envelope::rewrap_admin(&payload, &self.escrow, grant)
                .map_err(|e| Self::decrypt_failed("rewrap", item_id, e))?;
            if self.store.compare_and_swap_payload(payload.revision, next)? {
                return Ok(RewrapStep::Rewrapped);
            }
            tracing::debug!(item_id = %item_id, "payload changed during re-wrap, retrying");
        }
        Err(VaultError::RewrapConflict(item_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::audit::{AuditLog, AuditOutcome};
    use crate::crypto::KEY_LEN;
    use crate::error::{AuditError, StoreError};
    use crate::store::{MemoryStore, UpsertOutcome};

    struct AllowAll;

    impl PermissionChecker for AllowAll {
        fn check(&self, _: &str, _: Capability, _: &str) -> Decision {
            Decision::Allow
        }
    }

    fn vault_over(store: Arc<dyn VaultStore>, audit: Arc<dyn AuditSink>) -> AnamnesisVault {
        AnamnesisVault::new(
            VaultConfig::default(),
            AdminEscrow::new(AdminKek::from_bytes([1u8; KEY_LEN])),
            store,
            Arc::new(AllowAll),
            audit,
        )
        .unwrap()
    }

    fn vault() -> (AnamnesisVault, Arc<AuditLog>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditLog::new());
        (vault_over(store.clone(), audit.clone()), audit, store)
    }

    /// Fails the next `failures` conditional writes, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn trip(&self) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    impl VaultStore for FlakyStore {
        fn get_payload(&self, item_id: &str) -> Result<Option<EncryptedPayload>, StoreError> {
            self.inner.get_payload(item_id)
        }

        fn upsert_payload(&self, payload: EncryptedPayload) -> Result<UpsertOutcome, StoreError> {
            self.inner.upsert_payload(payload)
        }

        fn compare_and_swap_payload(
            &self,
            expected_revision: u64,
            payload: EncryptedPayload,
        ) -> Result<bool, StoreError> {
            self.trip()?;
            self.inner.compare_and_swap_payload(expected_revision, payload)
        }

        fn remove_payload_if(&self, item_id: &str, expected_revision: u64) -> Result<bool, StoreError> {
            self.trip()?;
            self.inner.remove_payload_if(item_id, expected_revision)
        }

        fn list_item_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_item_ids()
        }

        fn list_item_ids_in_scope(&self, scope: &ScopeKey) -> Result<Vec<String>, StoreError> {
            self.inner.list_item_ids_in_scope(scope)
        }

        fn get_kdf_parameters(&self, scope: &ScopeKey) -> Result<Option<KdfParameters>, StoreError> {
            self.inner.get_kdf_parameters(scope)
        }

        fn insert_kdf_parameters_if_absent(
            &self,
            scope: &ScopeKey,
            params: KdfParameters,
        ) -> Result<KdfParameters, StoreError> {
            self.inner.insert_kdf_parameters_if_absent(scope, params)
        }
    }

    /// Refuses successful write entries while `refuse_writes` is set.
    #[derive(Default)]
    struct WriteRefusingAudit {
        refuse_writes: AtomicBool,
    }

    impl AuditSink for WriteRefusingAudit {
        fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            let is_write = entry.action == AuditAction::Write && entry.outcome == AuditOutcome::Success;
            if is_write && self.refuse_writes.load(Ordering::SeqCst) {
                return Err(AuditError::Unavailable("disk full".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(
            failure_reason(&VaultError::AuthenticationFailure),
            FailureReason::AuthenticationFailure
        );
        assert_eq!(
            failure_reason(&VaultError::NotFound("x".into())),
            FailureReason::NotFound
        );
        assert_eq!(failure_reason(&VaultError::Crypto), FailureReason::CryptoFailure);
    }

    #[test]
    fn test_change_passphrase_reuses_scope_parameters() {
        let (vault, audit, store) = vault();
        let subject = SubjectRef::new("rec-1", "pat-1", "clinic-1");
        vault
            .write("dr-a", &subject, ScopeMode::Patient, "allergic to penicillin", "old-pass")
            .unwrap();
        let before = store.get_payload("rec-1").unwrap().unwrap();

        let acks = vault
            .change_passphrase("dr-a", "rec-1", "old-pass", "new-pass")
            .unwrap();
        assert_eq!(acks.len(), 1);
        let after = store.get_payload("rec-1").unwrap().unwrap();

        assert_eq!(after.kdf_salt, before.kdf_salt);
        assert_eq!(after.subject_id, "pat-1");
        assert_ne!(after.ciphertext, before.ciphertext);
        assert!(matches!(
            vault.decrypt_as_user("dr-a", "rec-1", "old-pass"),
            Err(VaultError::AuthenticationFailure)
        ));
        assert_eq!(
            &*vault.decrypt_as_user("dr-a", "rec-1", "new-pass").unwrap(),
            "allergic to penicillin"
        );

        let actions: Vec<_> = audit.entries().iter().map(|e| (e.action, e.outcome)).collect();
        assert_eq!(
            &actions[1..3],
            &[
                (AuditAction::DecryptUser, AuditOutcome::Success),
                (AuditAction::Write, AuditOutcome::Success)
            ]
        );
    }

    #[test]
    fn test_change_passphrase_with_wrong_old_passphrase_writes_nothing() {
        let (vault, _audit, store) = vault();
        let subject = SubjectRef::new("rec-1", "pat-1", "clinic-1");
        vault
            .write("dr-a", &subject, ScopeMode::Record, "note", "old-pass")
            .unwrap();
        let before = store.get_payload("rec-1").unwrap().unwrap();

        assert!(matches!(
            vault.change_passphrase("dr-a", "rec-1", "not-it", "new-pass"),
            Err(VaultError::AuthenticationFailure)
        ));
        assert_eq!(store.get_payload("rec-1").unwrap().unwrap(), before);
    }

    #[test]
    fn test_change_passphrase_moves_every_item_of_shared_scope() {
        let (vault, _audit, store) = vault();
        for (id, text) in [("rec-1", "first visit"), ("rec-2", "follow-up")] {
            let subject = SubjectRef::new(id, "pat-1", "clinic-1");
            vault
                .write("dr-a", &subject, ScopeMode::Patient, text, "old-pass")
                .unwrap();
        }
        let outsider = SubjectRef::new("rec-9", "pat-2", "clinic-1");
        vault
            .write("dr-a", &outsider, ScopeMode::Patient, "other patient", "old-pass")
            .unwrap();

        let acks = vault
            .change_passphrase("dr-a", "rec-1", "old-pass", "new-pass")
            .unwrap();
        let ids: Vec<_> = acks.iter().map(|a| a.item_id.as_str()).collect();
        assert_eq!(ids, ["rec-1", "rec-2"]);

        for (id, text) in [("rec-1", "first visit"), ("rec-2", "follow-up")] {
            assert_eq!(&*vault.decrypt_as_user("dr-a", id, "new-pass").unwrap(), text);
            assert!(matches!(
                vault.decrypt_as_user("dr-a", id, "old-pass"),
                Err(VaultError::AuthenticationFailure)
            ));
        }
        assert_eq!(&*vault.decrypt_as_user("dr-a", "rec-9", "old-pass").unwrap(), "other patient");

        // Items written into the scope afterwards must use the new passphrase.
        let later = SubjectRef::new("rec-3", "pat-1", "clinic-1");
        assert!(matches!(
            vault.write("dr-a", &later, ScopeMode::Patient, "later", "old-pass"),
            Err(VaultError::AuthenticationFailure)
        ));
        vault
            .write("dr-a", &later, ScopeMode::Patient, "later", "new-pass")
            .unwrap();
        assert!(store.get_payload("rec-3").unwrap().is_some());
    }

    #[test]
    fn test_change_passphrase_stops_before_writing_on_unreadable_sibling() {
        let (vault, _audit, store) = vault();
        for id in ["rec-1", "rec-2"] {
            let subject = SubjectRef::new(id, "pat-1", "clinic-1");
            vault
                .write("dr-a", &subject, ScopeMode::Patient, "note", "old-pass")
                .unwrap();
        }
        let mut damaged = store.get_payload("rec-2").unwrap().unwrap();
        damaged.ciphertext[0] ^= 0x01;
        store.upsert_payload(damaged).unwrap();
        let before = store.get_payload("rec-1").unwrap().unwrap();

        assert!(matches!(
            vault.change_passphrase("dr-a", "rec-1", "old-pass", "new-pass"),
            Err(VaultError::AuthenticationFailure)
        ));
        assert_eq!(store.get_payload("rec-1").unwrap().unwrap(), before);
    }

    #[test]
    fn test_shared_scope_write_with_other_passphrase_is_refused() {
        let (vault, audit, store) = vault();
        let first = SubjectRef::new("rec-1", "pat-1", "clinic-1");
        vault
            .write("dr-a", &first, ScopeMode::Patient, "first", "alpha")
            .unwrap();

        let second = SubjectRef::new("rec-2", "pat-1", "clinic-1");
        assert!(matches!(
            vault.write("dr-b", &second, ScopeMode::Patient, "second", "beta"),
            Err(VaultError::AuthenticationFailure)
        ));
        assert!(store.get_payload("rec-2").unwrap().is_none());

        let last = audit.entries().pop().unwrap();
        assert_eq!(last.action, AuditAction::Write);
        assert_eq!(last.outcome, AuditOutcome::Failure);
        assert_eq!(last.failure_reason, Some(FailureReason::AuthenticationFailure));

        // Record scopes are per item and take any passphrase.
        let own = SubjectRef::new("rec-3", "pat-1", "clinic-1");
        vault
            .write("dr-b", &own, ScopeMode::Record, "own", "beta")
            .unwrap();
    }

    #[test]
    fn test_rewriting_the_only_item_of_a_scope_may_change_passphrase() {
        let (vault, _audit, _store) = vault();
        let subject = SubjectRef::new("rec-1", "clinic-7", "clinic-7");
        vault
            .write("dr-a", &subject, ScopeMode::Clinic, "v1", "alpha")
            .unwrap();
        vault
            .write("dr-a", &subject, ScopeMode::Clinic, "v2", "beta")
            .unwrap();
        assert_eq!(&*vault.decrypt_as_user("dr-a", "rec-1", "beta").unwrap(), "v2");
    }

    #[test]
    fn test_rollback_is_retried_after_store_error() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(0),
        });
        let audit = Arc::new(WriteRefusingAudit::default());
        let vault = vault_over(store.clone(), audit.clone());

        let subject = SubjectRef::new("rec-1", "pat-1", "clinic-1");
        vault
            .write("dr-a", &subject, ScopeMode::Record, "v1", "pw")
            .unwrap();
        let committed = store.get_payload("rec-1").unwrap().unwrap();

        audit.refuse_writes.store(true, Ordering::SeqCst);
        store.failures.store(1, Ordering::SeqCst);
        assert!(matches!(
            vault.write("dr-a", &subject, ScopeMode::Record, "v2", "pw"),
            Err(VaultError::AuditUnavailable)
        ));
        assert_eq!(store.get_payload("rec-1").unwrap().unwrap().ciphertext, committed.ciphertext);

        store.failures.store(1, Ordering::SeqCst);
        let fresh = SubjectRef::new("rec-2", "pat-1", "clinic-1");
        assert!(vault
            .write("dr-a", &fresh, ScopeMode::Record, "new", "pw")
            .is_err());
        assert!(store.get_payload("rec-2").unwrap().is_none());
    }

    #[test]
    fn test_rollback_gives_up_after_two_store_errors() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let audit = Arc::new(WriteRefusingAudit::default());
        audit.refuse_writes.store(true, Ordering::SeqCst);
        let vault = vault_over(store.clone(), audit);

        let subject = SubjectRef::new("rec-1", "pat-1", "clinic-1");
        assert!(matches!(
            vault.write("dr-a", &subject, ScopeMode::Record, "note", "pw"),
            Err(VaultError::AuditUnavailable)
        ));
        // The unaudited payload stays; the caller was still told the write failed.
        assert!(store.get_payload("rec-1").unwrap().is_some());
    }

    #[test]
    fn test_unsupported_schema_is_refused() {
        let (vault, _audit, store) = vault();
        let subject = SubjectRef::new("rec-1", "pat-1", "clinic-1");
        vault
            .write("dr-a", &subject, ScopeMode::Record, "note", "pw")
            .unwrap();
        let mut payload = store.get_payload("rec-1").unwrap().unwrap();
        payload.schema_version = 99;
        store.upsert_payload(payload).unwrap();

        assert!(matches!(
            vault.decrypt_as_admin("admin", "rec-1"),
            Err(VaultError::UnsupportedSchema(99))
        ));
    }
}
