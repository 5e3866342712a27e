//! Masked previews.
//!
//! A preview tells a viewer that something is stored and roughly how big
//! it is, without decrypting anything. The length is rounded up to a bucket
//! and is the only signal derived from the content; the prefix is shuffled
//! ciphertext encoding and carries no content hint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::crypto::TAG_LEN;
use crate::envelope::EncryptedPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Characters of ciphertext encoding shown in the preview.
    pub prefix_len: usize,
    /// Plaintext length is rounded up to a multiple of this.
    pub length_bucket: usize,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            prefix_len: 12,
            length_bucket: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedPreview {
    pub exists: bool,
    pub approximate_length: usize,
    pub obfuscated_prefix: String,
}

impl MaskedPreview {
    fn absent() -> Self {
        Self {
            exists: false,
            approximate_length: 0,
            obfuscated_prefix: String::new(),
        }
    }
}

/// Build a preview. Performs no decryption.
pub fn preview(payload: Option<&EncryptedPayload>, config: &MaskConfig) -> MaskedPreview {
    let Some(payload) = payload else {
        return MaskedPreview::absent();
    };

    let bucket = config.length_bucket.max(1);
    let plaintext_len = payload.ciphertext.len().saturating_sub(TAG_LEN);
    let approximate_length = plaintext_len.div_ceil(bucket) * bucket;

    let encoded = STANDARD.encode(&payload.ciphertext);
    let mut prefix: Vec<char> = encoded.chars().take(config.prefix_len).collect();
    prefix.shuffle(&mut rand::rng());

    MaskedPreview {
        exists: true,
        approximate_length,
        obfuscated_prefix: prefix.into_iter().collect(),
    }
}
