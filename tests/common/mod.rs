//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anamnesis_vault::error::AuditError;
use anamnesis_vault::{
    AdminEscrow, AdminKek, AnamnesisVault, AuditEntry, AuditLog, AuditSink, Capability, Decision,
    MemoryStore, PermissionChecker, VaultConfig, KEY_LEN,
};

/// Grants listed capabilities per actor, for every item.
#[derive(Default)]
pub struct GrantTable {
    grants: Mutex<HashSet<(String, Capability)>>,
}

impl GrantTable {
    pub fn grant(&self, actor_id: &str, capability: Capability) {
        self.grants
            .lock()
            .unwrap()
            .insert((actor_id.to_string(), capability));
    }

    pub fn revoke(&self, actor_id: &str, capability: Capability) {
        self.grants
            .lock()
            .unwrap()
            .remove(&(actor_id.to_string(), capability));
    }
}

impl PermissionChecker for GrantTable {
    fn check(&self, actor_id: &str, capability: Capability, _subject_id: &str) -> Decision {
        if self
            .grants
            .lock()
            .unwrap()
            .contains(&(actor_id.to_string(), capability))
        {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// An audit log that can be switched off to simulate an outage.
#[derive(Default)]
pub struct SwitchableAudit {
    pub log: AuditLog,
    offline: AtomicBool,
}

impl SwitchableAudit {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl AuditSink for SwitchableAudit {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("audit backend offline".into()));
        }
        self.log.append(entry)
    }
}

pub const CLINICIAN: &str = "dr-house";
pub const ADMIN: &str = "admin-cuddy";

pub struct Fixture {
    pub vault: AnamnesisVault,
    pub store: Arc<MemoryStore>,
    pub grants: Arc<GrantTable>,
    pub audit: Arc<SwitchableAudit>,
}

pub fn admin_kek(fill: u8) -> AdminKek {
    AdminKek::from_bytes([fill; KEY_LEN])
}

/// A vault where the clinician may write, read and user-decrypt, and the
/// admin may additionally escrow-decrypt.
pub fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let grants = Arc::new(GrantTable::default());
    let audit = Arc::new(SwitchableAudit::default());

    for capability in [Capability::Write, Capability::Read, Capability::DecryptAsUser] {
        grants.grant(CLINICIAN, capability);
        grants.grant(ADMIN, capability);
    }
    grants.grant(ADMIN, Capability::DecryptAsAdmin);

    let vault = AnamnesisVault::new(
        VaultConfig::default(),
        AdminEscrow::new(admin_kek(0x11)),
        store.clone(),
        grants.clone(),
        audit.clone(),
    )
    .unwrap();

    Fixture {
        vault,
        store,
        grants,
        audit,
    }
}

/// A second vault over the fixture's store, grants and audit, as after a
/// process restart.
pub fn reopen(fx: &Fixture, escrow: AdminEscrow) -> AnamnesisVault {
    AnamnesisVault::new(
        VaultConfig::default(),
        escrow,
        fx.store.clone(),
        fx.grants.clone(),
        fx.audit.clone(),
    )
    .unwrap()
}
