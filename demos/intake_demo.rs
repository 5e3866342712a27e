//! End-to-end walk through an intake note's life.
//!
//! Run with: `RUST_LOG=anamnesis_vault=debug cargo run --example intake_demo`
//!
//! - A clinician stores a note under a patient-scoped passphrase
//! - A masked preview is shown without decrypting
//! - The patient reads it back with the passphrase
//! - An administrator recovers it through escrow, with no passphrase
//! - The administrator key is rotated
//! - Every attempt lands in a JSON-lines audit file

use std::collections::HashSet;
use std::sync::Arc;

use anamnesis_vault::{
    generate_admin_kek, AdminEscrow, AnamnesisVault, AuditLog, Capability, Decision,
    EnvKekSource, FileAuditSink, KekSource, MemoryStore, PermissionChecker, ScopeMode,
    SubjectRef, VaultConfig,
};
use tracing_subscriber::EnvFilter;

/// Static role table standing in for the real authorization service.
struct Roles {
    grants: HashSet<(&'static str, Capability)>,
}

impl PermissionChecker for Roles {
    fn check(&self, actor_id: &str, capability: Capability, _subject_id: &str) -> Decision {
        if self
            .grants
            .iter()
            .any(|(actor, cap)| *actor == actor_id && *cap == capability)
        {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Setup
    let config = VaultConfig::default();
    let kek = match EnvKekSource::new(config.admin_kek_env.clone()).load() {
        Ok(kek) => kek,
        Err(e) => {
            println!("{e}; generating an ephemeral administrator key");
            generate_admin_kek()?
        }
    };

    let audit_path = std::env::temp_dir().join("anamnesis_audit.jsonl");
    let audit = Arc::new(AuditLog::new().with_forward_sink(Box::new(FileAuditSink::new(&audit_path)?)));

    let roles = Roles {
        grants: HashSet::from([
            ("dr-lee", Capability::Write),
            ("dr-lee", Capability::Read),
            ("patient-42", Capability::DecryptAsUser),
            ("records-admin", Capability::DecryptAsAdmin),
        ]),
    };

    let vault = AnamnesisVault::new(
        config,
        AdminEscrow::new(kek),
        Arc::new(MemoryStore::new()),
        Arc::new(roles),
        audit.clone(),
    )?;

    // 2. Intake
    let subject = SubjectRef::new("intake-2024-001", "patient-42", "clinic-north");
    let ack = vault.write(
        "dr-lee",
        &subject,
        ScopeMode::Patient,
        "Patient reports insomnia for three weeks; no prior sleep medication.",
        "correct-horse-battery",
    )?;
    println!("stored {} (revision {}, admin key {})", ack.item_id, ack.revision, ack.admin_key_id);

    // 3. Masked preview
    let preview = vault.preview_masked("dr-lee", &ack.item_id)?;
    println!(
        "preview: exists={} ~{} bytes prefix={}",
        preview.exists, preview.approximate_length, preview.obfuscated_prefix
    );

    // 4. Patient reads with the passphrase
    let note = vault.decrypt_as_user("patient-42", &ack.item_id, "correct-horse-battery")?;
    println!("patient view: {}", note.as_str());

    // 5. Clinician lacks escrow rights
    if let Err(e) = vault.decrypt_as_admin("dr-lee", &ack.item_id) {
        println!("dr-lee escrow attempt refused: {e}");
    }

    // 6. Escrow recovery
    let recovered = vault.decrypt_as_admin("records-admin", &ack.item_id)?;
    println!("escrow view: {}", recovered.as_str());

    // 7. Rotate the administrator key
    let report = vault.rotate_admin_key(generate_admin_kek()?)?;
    println!(
        "rotation {} -> {}: {} re-wrapped, complete={}",
        report.from_key_id,
        report.to_key_id,
        report.rewrapped,
        report.is_complete()
    );

    println!("{} audit entries written to {}", audit.len(), audit_path.display());
    Ok(())
}
