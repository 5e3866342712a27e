//! Scope resolution.
//!
//! A scope decides which persisted salt an item's user-path key reuses.
//! This is a deployment-selected confidentiality/usability tradeoff:
//!
//! | mode      | scope identity | one passphrase unlocks         |
//! |-----------|----------------|--------------------------------|
//! | `record`  | record id      | exactly one item               |
//! | `patient` | patient id     | every item of that patient     |
//! | `clinic`  | clinic id      | every item in the clinic       |

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::keys::KdfParameters;
use crate::store::VaultStore;

/// The three scoping modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    Record,
    Patient,
    Clinic,
}

impl ScopeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Patient => "patient",
            Self::Clinic => "clinic",
        }
    }
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers of an anamnesis item and its owners.
///
/// `record_id` is also the key the payload is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRef {
    pub record_id: String,
    pub patient_id: String,
    pub clinic_id: String,
}

impl SubjectRef {
    pub fn new(
        record_id: impl Into<String>,
        patient_id: impl Into<String>,
        clinic_id: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            patient_id: patient_id.into(),
            clinic_id: clinic_id.into(),
        }
    }

    /// Rebuild the part of a subject that `scope` depends on. The other
    /// owner ids are left empty.
    pub(crate) fn for_scope(record_id: &str, scope: &ScopeKey) -> Self {
        let identity = scope.identity.as_str();
        match scope.mode {
            ScopeMode::Record => Self::new(record_id, "", ""),
            ScopeMode::Patient => Self::new(record_id, identity, ""),
            ScopeMode::Clinic => Self::new(record_id, "", identity),
        }
    }
}

/// The key under which `KdfParameters` are stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub mode: ScopeMode,
    pub identity: String,
}

/// Pick the scope identity for `mode`.
pub fn resolve(mode: ScopeMode, subject: &SubjectRef) -> VaultResult<ScopeKey> {
    let identity = match mode {
        ScopeMode::Record => &subject.record_id,
        ScopeMode::Patient => &subject.patient_id,
        ScopeMode::Clinic => &subject.clinic_id,
    };
    if identity.is_empty() {
        return Err(VaultError::InvalidInput("missing scope identifier"));
    }
    Ok(ScopeKey {
        mode,
        identity: identity.clone(),
    })
}

/// Resolves or creates the `KdfParameters` of a scope.
pub(crate) struct ScopeResolver {
    store: Arc<dyn VaultStore>,
    iterations: u32,
}

impl ScopeResolver {
    pub(crate) fn new(store: Arc<dyn VaultStore>, iterations: u32) -> Self {
        Self { store, iterations }
    }

    /// Return the scope's parameters, creating them on first use.
    ///
    /// Creation goes through the store's insert-if-absent, so two writers
    /// racing on a new scope end up with the same salt.
    pub(crate) fn parameters_for(&self, scope: &ScopeKey) -> VaultResult<KdfParameters> {
        if let Some(existing) = self.store.get_kdf_parameters(scope)? {
            return Ok(existing);
        }

        let fresh = KdfParameters::generate(self.iterations).map_err(VaultError::from_encrypt)?;
        let stored = self.store.insert_kdf_parameters_if_absent(scope, fresh)?;
        tracing::debug!(
            mode = %scope.mode,
            scope = %scope.identity,
            iterations = stored.iterations,
            "kdf parameters resolved for new scope"
        );
        Ok(stored)
    }
}
