//! Permission-check seam.
//!
//! Authorization decisions are made elsewhere. The vault asks a
//! `PermissionChecker` before every operation and only acts on `Allow`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A capability the vault asks about.
///
/// `DecryptAsAdmin` is distinct from `Read` and `DecryptAsUser`; holding
/// either of those grants nothing on the escrow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    DecryptAsUser,
    DecryptAsAdmin,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::DecryptAsUser => "decrypt_as_user",
            Self::DecryptAsAdmin => "decrypt_as_admin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// External authorization collaborator.
pub trait PermissionChecker: Send + Sync {
    fn check(&self, actor_id: &str, capability: Capability, subject_id: &str) -> Decision;
}
