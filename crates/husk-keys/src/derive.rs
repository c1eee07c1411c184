//! Per-file key derivation.
//!
//! The default derivation encrypts the first `key_size` bytes of the
//! wrapping key with AES-128-ECB, keyed by the file's 16-byte nonce.
//! ECB's weakness (identical input blocks produce identical output
//! blocks) does not apply: the input is uniformly random key material,
//! never structured data. DIRECT_KEY and inline modes skip derivation and
//! pass the wrapping key through unchanged.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::warn;
use zeroize::Zeroizing;

use husk_core::config::KeySetupConfig;
use husk_core::policy::{EncryptionPolicy, FILE_NONCE_SIZE};
use husk_core::{HuskError, HuskResult};

use crate::keyring::{self, KeySource};
use crate::modes::{EncryptionMode, DIRECT_KEY_MIN_IV_SIZE};

const AES_BLOCK_SIZE: usize = 16;

/// A per-file key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl FileKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a `key_size`-byte file key by encrypting the leading bytes of
/// the wrapping key under the nonce.
///
/// The wrapping key's length is validated against the mode at lookup
/// time; by this point `raw_master_key` is always long enough.
pub fn derive_file_key(
    raw_master_key: &[u8],
    key_size: usize,
    nonce: &[u8; FILE_NONCE_SIZE],
) -> FileKey {
    debug_assert!(raw_master_key.len() >= key_size);
    debug_assert_eq!(key_size % AES_BLOCK_SIZE, 0);

    let cipher = Aes128::new(nonce.into());
    let mut derived = raw_master_key[..key_size].to_vec();
    for block in derived.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    FileKey::from_bytes(derived)
}

/// Locate the wrapping key for `policy` and produce the per-file key for
/// `mode`.
///
/// The keyring lookup runs before DIRECT_KEY validation so that an
/// absent key reports `NoKey` even when the policy is also misconfigured;
/// callers rely on `NoKey` for deferred-key workflows.
pub fn find_and_derive_key(
    source: &dyn KeySource,
    config: &KeySetupConfig,
    legacy_prefix: Option<&str>,
    policy: &EncryptionPolicy,
    mode: &'static EncryptionMode,
) -> HuskResult<FileKey> {
    let wrapping = keyring::find_wrapping_key_with_fallback(
        source,
        config,
        legacy_prefix,
        &policy.master_key_descriptor,
        mode.key_size,
    )?;

    if policy.uses_direct_key() {
        if mode.iv_size < DIRECT_KEY_MIN_IV_SIZE {
            warn!(mode = mode.name, "direct key mode is not allowed with this cipher");
            return Err(HuskError::InvalidPolicy(format!(
                "direct key mode not allowed with {}",
                mode.name
            )));
        }
        if policy.contents_mode != policy.filenames_mode {
            warn!("direct key mode requires matching contents and filenames modes");
            return Err(HuskError::InvalidPolicy(
                "direct key mode requires matching contents and filenames modes".into(),
            ));
        }
        return Ok(FileKey::from_bytes(
            wrapping.as_bytes()[..mode.key_size].to_vec(),
        ));
    }

    if mode.inline {
        // The inline engine consumes the wrapping key itself.
        return Ok(FileKey::from_bytes(
            wrapping.as_bytes()[..mode.key_size].to_vec(),
        ));
    }

    Ok(derive_file_key(wrapping.as_bytes(), mode.key_size, &policy.nonce))
}
