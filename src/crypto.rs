//! Low-level AEAD operations.
//!
//! This module and `keys` are the only places in the crate that touch
//! `ring::aead` and `ring::rand` directly. Every other module seals and
//! opens exclusively through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **IV**: 96-bit, generated fresh per seal via `SystemRandom`
//! - **Key size**: 256 bits
//!
//! Unlike a nonce-prefixed blob, the IV is returned separately. Payloads
//! persist every IV as its own field next to the bytes it protects.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Size of an IV in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of every symmetric key in the crate (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Output of a single seal: the IV it used and the ciphertext with the tag
/// appended.
#[derive(Debug, Clone)]
pub(crate) struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Fill a fixed-size array from the system RNG.
///
/// `SystemRandom` is the only source of randomness for key material, IVs
/// and salts. There is no counter-based IV generation.
pub(crate) fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| CryptoError::RandomnessFailure)?;
    Ok(buf)
}

fn bind_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` under `key_bytes` with a fresh IV.
///
/// `aad` is authenticated but not encrypted. The same bytes must be passed
/// back to `open`.
pub(crate) fn seal(
    key_bytes: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed, CryptoError> {
    let key = bind_key(key_bytes)?;
    let nonce: [u8; NONCE_LEN] = random_array()?;

    let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
    in_out.extend_from_slice(plaintext);

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(aad),
        &mut in_out,
    )
    .map_err(|_| CryptoError::EncryptionFailure)?;

    Ok(Sealed {
        nonce,
        ciphertext: in_out,
    })
}

/// Open a ciphertext produced by `seal`.
///
/// If the key, IV, AAD or ciphertext is wrong, the GCM check fails and the
/// caller receives no partial plaintext. The returned buffer is wiped on drop.
pub(crate) fn open(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailure);
    }

    let key = bind_key(key_bytes)?;
    let mut buf = Zeroizing::new(ciphertext.to_vec());

    let len = key
        .open_in_place(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(aad),
            &mut buf[..],
        )
        .map_err(|_| CryptoError::DecryptionFailure)?
        .len();
    buf.truncate(len);

    Ok(buf)
}
