//! Static registry of supported encryption modes.
//!
//! Modes are identified on disk by the wire ids in `husk_core::policy`.
//! Each mode fixes its cipher identifier, key size, and IV size; the
//! registry also defines which (contents, filenames) pairings a policy
//! may request.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use husk_core::policy::{
    EncryptionPolicy, MODE_ADIANTUM, MODE_AES_128_CBC, MODE_AES_128_CTS, MODE_AES_256_CTS,
    MODE_AES_256_XTS, MODE_PRIVATE,
};
use husk_core::{HuskError, HuskResult};

use crate::fs::InodeKind;

/// Minimum IV size for DIRECT_KEY policies: the IV must hold an 8-byte
/// block counter followed by the 16-byte file nonce.
pub const DIRECT_KEY_MIN_IV_SIZE: usize = 24;

/// A supported encryption mode. Only the statics in this module exist;
/// the one-time diagnostics latch keeps the set closed to construction
/// elsewhere.
#[derive(Debug)]
pub struct EncryptionMode {
    /// Wire id as stored in policy records.
    pub wire_id: u8,
    /// Human-readable name for logs.
    pub name: &'static str,
    /// Cipher identifier handed to the cipher engine.
    pub cipher: &'static str,
    /// Key length in bytes.
    pub key_size: usize,
    /// IV length in bytes.
    pub iv_size: usize,
    /// Mode requires an ESSIV IV generator.
    pub needs_essiv: bool,
    /// Key is consumed by an external inline (hardware) engine rather
    /// than a cipher handle allocated here.
    pub inline: bool,
    logged: AtomicBool,
}

impl EncryptionMode {
    /// Log which engine implementation backs this mode, once per process.
    pub fn log_implementation(&self, implementation: &str) {
        if !self.logged.swap(true, Ordering::Relaxed) {
            info!(mode = self.name, implementation, "using cipher implementation");
        }
    }
}

pub static AES_256_XTS: EncryptionMode = EncryptionMode {
    wire_id: MODE_AES_256_XTS,
    name: "AES-256-XTS",
    cipher: "xts(aes)",
    key_size: 64,
    iv_size: 16,
    needs_essiv: false,
    inline: false,
    logged: AtomicBool::new(false),
};

pub static AES_256_CTS: EncryptionMode = EncryptionMode {
    wire_id: MODE_AES_256_CTS,
    name: "AES-256-CTS-CBC",
    cipher: "cts(cbc(aes))",
    key_size: 32,
    iv_size: 16,
    needs_essiv: false,
    inline: false,
    logged: AtomicBool::new(false),
};

pub static AES_128_CBC: EncryptionMode = EncryptionMode {
    wire_id: MODE_AES_128_CBC,
    name: "AES-128-CBC",
    cipher: "cbc(aes)",
    key_size: 16,
    iv_size: 16,
    needs_essiv: true,
    inline: false,
    logged: AtomicBool::new(false),
};

pub static AES_128_CTS: EncryptionMode = EncryptionMode {
    wire_id: MODE_AES_128_CTS,
    name: "AES-128-CTS-CBC",
    cipher: "cts(cbc(aes))",
    key_size: 16,
    iv_size: 16,
    needs_essiv: false,
    inline: false,
    logged: AtomicBool::new(false),
};

pub static ADIANTUM: EncryptionMode = EncryptionMode {
    wire_id: MODE_ADIANTUM,
    name: "Adiantum",
    cipher: "adiantum(xchacha12,aes)",
    key_size: 32,
    iv_size: 32,
    needs_essiv: false,
    inline: false,
    logged: AtomicBool::new(false),
};

pub static AES_256_XTS_INLINE: EncryptionMode = EncryptionMode {
    wire_id: MODE_PRIVATE,
    name: "AES-256-XTS-inline",
    cipher: "xts(aes)",
    key_size: 64,
    iv_size: 16,
    needs_essiv: false,
    inline: true,
    logged: AtomicBool::new(false),
};

pub static AVAILABLE_MODES: [&EncryptionMode; 6] = [
    &AES_256_XTS,
    &AES_256_CTS,
    &AES_128_CBC,
    &AES_128_CTS,
    &ADIANTUM,
    &AES_256_XTS_INLINE,
];

pub fn mode_by_id(wire_id: u8) -> Option<&'static EncryptionMode> {
    match wire_id {
        MODE_AES_256_XTS => Some(&AES_256_XTS),
        MODE_AES_256_CTS => Some(&AES_256_CTS),
        MODE_AES_128_CBC => Some(&AES_128_CBC),
        MODE_AES_128_CTS => Some(&AES_128_CTS),
        MODE_ADIANTUM => Some(&ADIANTUM),
        MODE_PRIVATE => Some(&AES_256_XTS_INLINE),
        _ => None,
    }
}

/// Resolve a policy's mode bytes to registry entries, enforcing the
/// allowed pairings. Anything else is an invalid policy.
pub fn lookup_mode_pair(
    contents: u8,
    filenames: u8,
) -> HuskResult<(&'static EncryptionMode, &'static EncryptionMode)> {
    match (contents, filenames) {
        (MODE_AES_256_XTS, MODE_AES_256_CTS) => Ok((&AES_256_XTS, &AES_256_CTS)),
        (MODE_AES_128_CBC, MODE_AES_128_CTS) => Ok((&AES_128_CBC, &AES_128_CTS)),
        (MODE_ADIANTUM, MODE_ADIANTUM) => Ok((&ADIANTUM, &ADIANTUM)),
        (MODE_PRIVATE, MODE_AES_256_CTS) => Ok((&AES_256_XTS_INLINE, &AES_256_CTS)),
        _ => Err(HuskError::InvalidPolicy(format!(
            "unsupported mode combination (contents {contents}, filenames {filenames})"
        ))),
    }
}

pub fn valid_mode_combination(contents: u8, filenames: u8) -> bool {
    lookup_mode_pair(contents, filenames).is_ok()
}

/// Pick the mode governing this inode: contents mode for regular files,
/// filenames mode for directories and symlinks.
///
/// # Panics
///
/// Panics if `kind` is not encryptable. The filesystem driver must never
/// request encryption info for special files.
pub fn select_mode(
    policy: &EncryptionPolicy,
    kind: InodeKind,
    inline_supported: bool,
) -> HuskResult<&'static EncryptionMode> {
    let (contents, filenames) = lookup_mode_pair(policy.contents_mode, policy.filenames_mode)?;
    match kind {
        InodeKind::Regular => {
            if contents.inline && !inline_supported {
                return Err(HuskError::Unsupported(format!(
                    "{} requires inline encryption support from the volume",
                    contents.name
                )));
            }
            Ok(contents)
        }
        InodeKind::Directory | InodeKind::Symlink => Ok(filenames),
        InodeKind::Special => {
            panic!("encryption info requested for a non-encryptable inode kind")
        }
    }
}
