//! Traits implemented by the filesystem driver embedding this crate.

use husk_core::policy::EncryptionPolicy;
use husk_core::{HuskError, HuskResult};

use crate::derive::FileKey;
use crate::modes::EncryptionMode;
use crate::setup::CryptoInfoSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    Directory,
    Symlink,
    /// Device nodes, fifos, sockets. Never encryptable.
    Special,
}

/// An inode as seen by key setup. The driver owns the actual inode and
/// embeds a `CryptoInfoSlot` in it.
pub trait Inode: Send + Sync {
    fn ino(&self) -> u64;

    fn kind(&self) -> InodeKind;

    /// On-disk encrypted flag. Unflagged inodes are only eligible for
    /// the dummy policy on volumes that enable it.
    fn is_encrypted(&self) -> bool {
        true
    }

    /// Classified files take the alternate derivation path through the
    /// configured [`ClassifiedKeyProvider`].
    fn is_classified(&self) -> bool {
        false
    }

    fn crypto_slot(&self) -> &CryptoInfoSlot;

    fn crypto_slot_mut(&mut self) -> &mut CryptoInfoSlot;
}

/// The metadata store holding policy records.
pub trait Volume: Send + Sync {
    /// The serialized policy record for this inode, or None when no
    /// record is stored.
    fn get_policy(&self, inode: &dyn Inode) -> HuskResult<Option<Vec<u8>>>;

    /// Test-mode hook: inodes without a stored record get a fixed dummy
    /// policy instead of an error.
    fn dummy_policy_enabled(&self, _inode: &dyn Inode) -> bool {
        false
    }

    /// Whether the volume's storage path can consume inline-mode keys.
    fn supports_inline_encryption(&self) -> bool {
        false
    }

    /// Keyring prefix tried after the primary one misses, for keys
    /// provisioned under an older naming scheme.
    fn legacy_key_prefix(&self) -> Option<&str> {
        None
    }
}

/// Alternate key-derivation provider for classified files. Purely a
/// delegation seam; the provider owns its own key-wrapping scheme.
pub trait ClassifiedKeyProvider: Send + Sync {
    /// Produce the per-file key, replacing the standard derivation path.
    fn derive_key(
        &self,
        inode: &dyn Inode,
        policy: &EncryptionPolicy,
        mode: &'static EncryptionMode,
    ) -> HuskResult<FileKey>;

    /// Sensitive files report derivation failures to the audit sink.
    fn is_sensitive(&self, _inode: &dyn Inode) -> bool {
        false
    }

    /// Best-effort audit notification; failures here never mask the
    /// original derivation error.
    fn audit_failure(&self, _inode: &dyn Inode, _error: &HuskError) {}
}
