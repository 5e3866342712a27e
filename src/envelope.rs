//! Envelope encryption with two independent unwrap paths.
//!
//! Every item gets its own random data key (DEK). The content is sealed
//! under the DEK, and the DEK is sealed twice more:
//!
//! ```text
//! DEK ──▶ AES-256-GCM(plaintext)                       ──▶ ciphertext
//! DEK ──▶ AES-256-GCM under PBKDF2(passphrase, salt)   ──▶ wrapped_key_user
//! DEK ──▶ AES-256-GCM under the current admin KEK      ──▶ wrapped_key_admin
//! DEK ──▶ HKDF ──▶ HMAC-SHA256(all other fields)       ──▶ binding_tag
//! ```
//!
//! Either wrapped copy alone recovers the DEK. The binding tag ties every
//! field of the payload to that DEK, so flipping a bit in *any* IV, in
//! either wrapped blob, or in the ciphertext fails both paths.

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, NONCE_LEN};
use crate::error::CryptoError;
use crate::escrow::{AdminEscrow, EscrowGrant};
use crate::keys::{self, DataKey, KdfParameters, WrapKey, SALT_LEN};
use crate::scope::{ScopeKey, ScopeMode};

/// Payload layout version written by this crate.
pub const SCHEMA_VERSION: u16 = 1;

/// A sealed copy of a data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub iv: [u8; NONCE_LEN],
    /// Sealed DEK with the GCM tag appended.
    pub bytes: Vec<u8>,
}

/// The persisted bundle for one anamnesis item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub schema_version: u16,
    /// The anamnesis item this payload belongs to. Store key.
    pub item_id: String,
    pub mode: ScopeMode,
    /// Scope identity the KDF salt is bound to.
    pub subject_id: String,
    /// Content ciphertext with the GCM tag appended.
    pub ciphertext: Vec<u8>,
    pub content_iv: [u8; NONCE_LEN],
    pub wrapped_key_user: WrappedKey,
    pub wrapped_key_admin: WrappedKey,
    /// Generation of the administrator KEK that produced `wrapped_key_admin`.
    pub admin_key_id: u32,
    pub kdf_salt: [u8; SALT_LEN],
    pub kdf_iterations: u32,
    pub binding_tag: Vec<u8>,
    /// Assigned by the store on every write.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

/// Everything `encrypt` needs besides the escrow.
pub(crate) struct SealRequest<'a> {
    pub item_id: &'a str,
    pub scope: &'a ScopeKey,
    pub params: &'a KdfParameters,
    /// Derived from the passphrase and `params`.
    pub wrap_key: &'a WrapKey,
    pub plaintext: &'a [u8],
}

fn content_aad(version: u16, mode: ScopeMode, subject_id: &str, item_id: &str) -> Vec<u8> {
    format!("anamnesis|v{version}|{mode}|{subject_id}|{item_id}").into_bytes()
}

fn user_wrap_aad(item_id: &str) -> Vec<u8> {
    format!("anamnesis-dek|user|{item_id}").into_bytes()
}

/// Seal a new payload.
///
/// The wrap key and DEK are dropped, and so zeroised, before this returns.
/// The payload comes back with `revision == 0`; the store assigns the real one.
pub(crate) fn encrypt(
    request: &SealRequest<'_>,
    escrow: &AdminEscrow,
) -> Result<EncryptedPayload, CryptoError> {
    let SealRequest {
        item_id,
        scope,
        params,
        wrap_key,
        plaintext,
    } = *request;

    let dek = DataKey::generate()?;
    let content = crypto::seal(
        dek.as_bytes(),
        plaintext,
        &content_aad(SCHEMA_VERSION, scope.mode, &scope.identity, item_id),
    )?;

    let wrapped_key_user = {
        let sealed = crypto::seal(wrap_key.as_bytes(), dek.as_bytes(), &user_wrap_aad(item_id))?;
        WrappedKey {
            iv: sealed.nonce,
            bytes: sealed.ciphertext,
        }
    };

    let (admin_key_id, wrapped_key_admin) = escrow.wrap_dek(&dek, item_id)?;

    let mut payload = EncryptedPayload {
        schema_version: SCHEMA_VERSION,
        item_id: item_id.to_string(),
        mode: scope.mode,
        subject_id: scope.identity.clone(),
        ciphertext: content.ciphertext,
        content_iv: content.nonce,
        wrapped_key_user,
        wrapped_key_admin,
        admin_key_id,
        kdf_salt: params.salt,
        kdf_iterations: params.iterations,
        binding_tag: Vec::new(),
        revision: 0,
        created_at: Utc::now(),
    };
    payload.binding_tag = binding_tag(&dek, &payload)?;

    Ok(payload)
}

/// Recover the plaintext with the data subject's passphrase.
///
/// Two independent checks must pass: the user wrap must open under the
/// re-derived key, and the content must open under the recovered DEK.
pub(crate) fn decrypt_user_path(
    payload: &EncryptedPayload,
    passphrase: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let dek = {
        let wrap_key =
            keys::derive_wrap_key(passphrase, &payload.kdf_salt, payload.kdf_iterations)?;
        let raw = crypto::open(
            wrap_key.as_bytes(),
            &payload.wrapped_key_user.iv,
            &payload.wrapped_key_user.bytes,
            &user_wrap_aad(&payload.item_id),
        )?;
        DataKey::from_slice(&raw)?
    };

    open_content(payload, &dek)
}

/// Check that `wrap_key` opens the payload's user wrap. The content is
/// not touched.
pub(crate) fn user_wrap_opens(payload: &EncryptedPayload, wrap_key: &WrapKey) -> Result<(), CryptoError> {
    let raw = crypto::open(
        wrap_key.as_bytes(),
        &payload.wrapped_key_user.iv,
        &payload.wrapped_key_user.bytes,
        &user_wrap_aad(&payload.item_id),
    )?;
    DataKey::from_slice(&raw).map(|_| ())
}

/// Recover the plaintext through the escrow. No passphrase involved.
pub(crate) fn decrypt_admin_path(
    payload: &EncryptedPayload,
    escrow: &AdminEscrow,
    grant: &EscrowGrant,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let dek = escrow.unwrap_dek(
        grant,
        payload.admin_key_id,
        &payload.wrapped_key_admin,
        &payload.item_id,
    )?;
    open_content(payload, &dek)
}

/// Re-wrap the admin copy of the DEK under the escrow's current KEK.
///
/// The content ciphertext and the user wrap are carried over byte for byte.
/// A payload whose binding tag does not verify is refused, never re-tagged.
pub(crate) fn rewrap_admin(
    payload: &EncryptedPayload,
    escrow: &AdminEscrow,
    grant: &EscrowGrant,
) -> Result<EncryptedPayload, CryptoError> {
    let dek = escrow.unwrap_dek(
        grant,
        payload.admin_key_id,
        &payload.wrapped_key_admin,
        &payload.item_id,
    )?;
    verify_binding(&dek, payload)?;

    let (admin_key_id, wrapped_key_admin) = escrow.wrap_dek(&dek, &payload.item_id)?;
    let mut next = payload.clone();
    next.admin_key_id = admin_key_id;
    next.wrapped_key_admin = wrapped_key_admin;
    next.binding_tag = binding_tag(&dek, &next)?;
    Ok(next)
}

fn open_content(payload: &EncryptedPayload, dek: &DataKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    verify_binding(dek, payload)?;
    crypto::open(
        dek.as_bytes(),
        &payload.content_iv,
        &payload.ciphertext,
        &content_aad(
            payload.schema_version,
            payload.mode,
            &payload.subject_id,
            &payload.item_id,
        ),
    )
}

// ---------------------------------------------------------------------------
// Binding tag
// ---------------------------------------------------------------------------

fn put_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Length-prefixed encoding of every field except `binding_tag`,
/// `revision` and `created_at`.
fn binding_transcript(payload: &EncryptedPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + payload.ciphertext.len());
    put_field(&mut buf, &payload.schema_version.to_be_bytes());
    put_field(&mut buf, payload.item_id.as_bytes());
    put_field(&mut buf, payload.mode.as_str().as_bytes());
    put_field(&mut buf, payload.subject_id.as_bytes());
    put_field(&mut buf, &payload.ciphertext);
    put_field(&mut buf, &payload.content_iv);
    put_field(&mut buf, &payload.wrapped_key_user.iv);
    put_field(&mut buf, &payload.wrapped_key_user.bytes);
    put_field(&mut buf, &payload.wrapped_key_admin.iv);
    put_field(&mut buf, &payload.wrapped_key_admin.bytes);
    put_field(&mut buf, &payload.admin_key_id.to_be_bytes());
    put_field(&mut buf, &payload.kdf_salt);
    put_field(&mut buf, &payload.kdf_iterations.to_be_bytes());
    buf
}

fn binding_tag(dek: &DataKey, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
    let key = keys::derive_binding_key(dek)?;
    Ok(hmac::sign(&key, &binding_transcript(payload)).as_ref().to_vec())
}

fn verify_binding(dek: &DataKey, payload: &EncryptedPayload) -> Result<(), CryptoError> {
    let key = keys::derive_binding_key(dek)?;
    hmac::verify(&key, &binding_transcript(payload), &payload.binding_tag)
        .map_err(|_| CryptoError::BindingMismatch)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::keys::{AdminKek, MIN_KDF_ITERATIONS};

    pub(crate) fn fixed_params() -> KdfParameters {
        KdfParameters {
            salt: [3u8; SALT_LEN],
            iterations: MIN_KDF_ITERATIONS,
            created_at: Utc::now(),
        }
    }

    fn seal_with(escrow: &AdminEscrow, item_id: &str, passphrase: &str, text: &str) -> EncryptedPayload {
        let scope = ScopeKey {
            mode: ScopeMode::Record,
            identity: item_id.to_string(),
        };
        let params = fixed_params();
        let wrap_key = keys::derive_wrap_key(passphrase, &params.salt, params.iterations).unwrap();
        let request = SealRequest {
            item_id,
            scope: &scope,
            params: &params,
            wrap_key: &wrap_key,
            plaintext: text.as_bytes(),
        };
        encrypt(&request, escrow).unwrap()
    }

    /// A real, decryptable payload for store-level tests.
    pub(crate) fn sample_payload(item_id: &str) -> EncryptedPayload {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        seal_with(&escrow, item_id, "pw", "sample")
    }

    #[test]
    fn test_both_paths_recover_plaintext() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let payload = seal_with(&escrow, "rec-1", "correct-horse", "Patient reports insomnia");

        let user = decrypt_user_path(&payload, "correct-horse").unwrap();
        let admin = decrypt_admin_path(&payload, &escrow, &EscrowGrant::new()).unwrap();
        assert_eq!(&user[..], b"Patient reports insomnia");
        assert_eq!(&admin[..], b"Patient reports insomnia");
    }

    #[test]
    fn test_wrapped_copies_use_distinct_ivs() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let payload = seal_with(&escrow, "rec-1", "pw", "text");
        assert_ne!(payload.content_iv, payload.wrapped_key_user.iv);
        assert_ne!(payload.wrapped_key_user.iv, payload.wrapped_key_admin.iv);
        assert_ne!(payload.wrapped_key_user.bytes, payload.wrapped_key_admin.bytes);
    }

    #[test]
    fn test_wrong_passphrase_fails_at_unwrap() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let payload = seal_with(&escrow, "rec-1", "correct-horse", "text");
        assert_eq!(
            decrypt_user_path(&payload, "wrong-pass").unwrap_err(),
            CryptoError::DecryptionFailure
        );
    }

    #[test]
    fn test_user_wrap_check_matches_passphrase() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let payload = seal_with(&escrow, "rec-1", "alpha", "text");
        let salt = fixed_params().salt;

        let right = keys::derive_wrap_key("alpha", &salt, MIN_KDF_ITERATIONS).unwrap();
        let wrong = keys::derive_wrap_key("beta", &salt, MIN_KDF_ITERATIONS).unwrap();
        assert!(user_wrap_opens(&payload, &right).is_ok());
        assert_eq!(
            user_wrap_opens(&payload, &wrong).unwrap_err(),
            CryptoError::DecryptionFailure
        );
    }

    #[test]
    fn test_swapped_item_id_is_detected() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let mut payload = seal_with(&escrow, "rec-1", "pw", "text");
        payload.item_id = "rec-2".into();
        assert!(decrypt_user_path(&payload, "pw").is_err());
        assert!(decrypt_admin_path(&payload, &escrow, &EscrowGrant::new()).is_err());
    }

    #[test]
    fn test_tampered_user_wrap_also_fails_admin_path() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let mut payload = seal_with(&escrow, "rec-1", "pw", "text");
        payload.wrapped_key_user.bytes[0] ^= 0x01;
        assert_eq!(
            decrypt_admin_path(&payload, &escrow, &EscrowGrant::new()).unwrap_err(),
            CryptoError::BindingMismatch
        );
    }

    #[test]
    fn test_rewrap_keeps_content_and_user_wrap() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let payload = seal_with(&escrow, "rec-1", "pw", "text");
        escrow.begin_rotation(AdminKek::from_bytes([10u8; KEY_LEN])).unwrap();

        let next = rewrap_admin(&payload, &escrow, &EscrowGrant::new()).unwrap();
        assert_eq!(next.admin_key_id, 2);
        assert_eq!(next.ciphertext, payload.ciphertext);
        assert_eq!(next.wrapped_key_user, payload.wrapped_key_user);
        assert_ne!(next.wrapped_key_admin, payload.wrapped_key_admin);

        assert_eq!(&decrypt_user_path(&next, "pw").unwrap()[..], b"text");
        assert_eq!(
            &decrypt_admin_path(&next, &escrow, &EscrowGrant::new()).unwrap()[..],
            b"text"
        );
    }

    #[test]
    fn test_rewrap_refuses_tampered_payload() {
        let escrow = AdminEscrow::new(AdminKek::from_bytes([9u8; KEY_LEN]));
        let mut payload = seal_with(&escrow, "rec-1", "pw", "text");
        payload.ciphertext[0] ^= 0x80;
        assert!(rewrap_admin(&payload, &escrow, &EscrowGrant::new()).is_err());
    }
}
