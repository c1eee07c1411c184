//! Per-inode encryption state: resolution, install, release.
//!
//! `KeyManager::setup_inode` walks the full chain for one inode: read
//! the policy record (or fabricate the dummy one), select the mode,
//! locate the wrapping key, derive or delegate the file key, build the
//! cipher transform and optional ESSIV generator, then install the
//! result through the inode's [`CryptoInfoSlot`]. Installation is
//! publish-once: when two threads resolve the same inode, the first
//! install wins and the loser's fully built candidate is dropped,
//! returning its cache reference and wiping its key material.
//!
//! A missing wrapping key is not a failure. Resolution reports success
//! with nothing installed so metadata operations proceed, and a later
//! call retries once the key has been provisioned.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use husk_core::config::KeySetupConfig;
use husk_core::policy::{
    EncryptionPolicy, KeyDescriptor, FILE_NONCE_SIZE, POLICY_FLAG_DIRECT_KEY,
};
use husk_core::{HuskError, HuskResult};

use crate::cache::{CacheRef, MasterKeyCache};
use crate::derive::{self, FileKey};
use crate::engine::{allocate_keyed_handle, CipherEngine, CipherHandle};
use crate::essiv::{EssivGenerator, ESSIV_IV_SIZE};
use crate::fs::{ClassifiedKeyProvider, Inode, Volume};
use crate::keyring::{self, KeySource, WrappingKey};
use crate::modes::{select_mode, EncryptionMode};

/// How an inode's file key reaches its cipher.
pub enum KeyTransform {
    /// Private transform owned by this inode alone.
    Owned(Box<dyn CipherHandle>),
    /// Counted reference into the shared-transform cache (DIRECT_KEY
    /// policies).
    Shared(CacheRef),
    /// Raw key retained for an external inline engine.
    Inline(FileKey),
}

impl fmt::Debug for KeyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyTransform::Owned(_) => f.write_str("Owned"),
            KeyTransform::Shared(shared) => f.debug_tuple("Shared").field(shared).finish(),
            KeyTransform::Inline(_) => f.write_str("Inline"),
        }
    }
}

/// Resolved encryption state for one inode. Dropping it releases every
/// held resource: owned transforms, the cache reference, key buffers.
pub struct InodeCryptoInfo {
    flags: u8,
    mode: &'static EncryptionMode,
    descriptor: KeyDescriptor,
    nonce: [u8; FILE_NONCE_SIZE],
    transform: KeyTransform,
    essiv: Option<EssivGenerator>,
}

impl InodeCryptoInfo {
    pub fn mode(&self) -> &'static EncryptionMode {
        self.mode
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    pub fn nonce(&self) -> &[u8; FILE_NONCE_SIZE] {
        &self.nonce
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn uses_direct_key(&self) -> bool {
        self.flags & POLICY_FLAG_DIRECT_KEY != 0
    }

    pub fn transform(&self) -> &KeyTransform {
        &self.transform
    }

    /// The cipher handle for software modes; None for inline modes,
    /// whose key lives with the external engine.
    pub fn handle(&self) -> Option<&dyn CipherHandle> {
        match &self.transform {
            KeyTransform::Owned(handle) => Some(handle.as_ref()),
            KeyTransform::Shared(shared) => Some(shared.handle()),
            KeyTransform::Inline(_) => None,
        }
    }

    pub fn essiv(&self) -> Option<&EssivGenerator> {
        self.essiv.as_ref()
    }
}

impl fmt::Debug for InodeCryptoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeCryptoInfo")
            .field("mode", &self.mode.name)
            .field("descriptor", &self.descriptor)
            .field("transform", &self.transform)
            .field("essiv", &self.essiv.is_some())
            .finish()
    }
}

/// Publish-once holder for an inode's crypto info, embedded in the
/// driver's inode type.
#[derive(Debug, Default)]
pub struct CryptoInfoSlot {
    cell: OnceLock<InodeCryptoInfo>,
}

impl CryptoInfoSlot {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Option<&InodeCryptoInfo> {
        self.cell.get()
    }

    pub fn is_installed(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Install `info` if the slot is empty. Returns the rejected
    /// candidate when another thread installed first; the caller must
    /// drop it to release its resources.
    pub fn install(&self, info: InodeCryptoInfo) -> Option<InodeCryptoInfo> {
        match self.cell.set(info) {
            Ok(()) => None,
            Err(loser) => Some(loser),
        }
    }

    /// Drop the installed info, if any. Eviction-time call; exclusive
    /// access guarantees no reader still holds a reference into the
    /// slot.
    pub fn clear(&mut self) -> bool {
        self.cell.take().is_some()
    }
}

/// Derives, installs, and releases per-inode encryption state.
pub struct KeyManager {
    config: KeySetupConfig,
    source: Arc<dyn KeySource>,
    engine: Arc<dyn CipherEngine>,
    classified: Option<Arc<dyn ClassifiedKeyProvider>>,
    cache: Arc<MasterKeyCache>,
}

impl KeyManager {
    pub fn new(
        config: KeySetupConfig,
        source: Arc<dyn KeySource>,
        engine: Arc<dyn CipherEngine>,
    ) -> Self {
        Self {
            config,
            source,
            engine,
            classified: None,
            cache: Arc::new(MasterKeyCache::new()),
        }
    }

    /// Route classified files through `provider` instead of the standard
    /// derivation.
    pub fn with_classified_provider(mut self, provider: Arc<dyn ClassifiedKeyProvider>) -> Self {
        self.classified = Some(provider);
        self
    }

    /// The shared-transform cache, exposed for observability.
    pub fn cache(&self) -> &MasterKeyCache {
        &self.cache
    }

    /// Resolve and install encryption state for `inode`. Idempotent: a
    /// second call on a resolved inode returns immediately.
    ///
    /// Returns Ok with nothing installed when the wrapping key is not in
    /// the keyring yet; a later call retries. Malformed policies are
    /// hard errors.
    pub fn setup_inode(&self, volume: &dyn Volume, inode: &dyn Inode) -> HuskResult<()> {
        if inode.crypto_slot().is_installed() {
            return Ok(());
        }

        let policy = self.effective_policy(volume, inode)?;
        let info = match self.build_info(volume, inode, &policy) {
            Ok(info) => info,
            Err(err) if err.is_no_key() => {
                debug!(ino = inode.ino(), "wrapping key unavailable, deferring");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if let Some(loser) = inode.crypto_slot().install(info) {
            debug!(ino = inode.ino(), "lost install race, discarding candidate");
            drop(loser);
        }
        Ok(())
    }

    /// Drop `inode`'s installed info, if any. Called on eviction; safe
    /// when nothing was ever installed.
    pub fn release_inode(&self, inode: &mut dyn Inode) {
        if inode.crypto_slot_mut().clear() {
            debug!(ino = inode.ino(), "released encryption info");
        }
    }

    /// Raw per-file key, for filesystems that hand keys to an inline or
    /// hardware engine. Inline modes return the retained buffer;
    /// software modes re-derive from the current keyring state.
    pub fn export_file_key(&self, volume: &dyn Volume, inode: &dyn Inode) -> HuskResult<FileKey> {
        let Some(info) = inode.crypto_slot().get() else {
            return Err(HuskError::NoKey);
        };
        if let KeyTransform::Inline(key) = info.transform() {
            return Ok(key.clone());
        }
        let policy = self.effective_policy(volume, inode)?;
        let mode = select_mode(&policy, inode.kind(), volume.supports_inline_encryption())?;
        self.resolve_file_key(volume, inode, &policy, mode)
    }

    /// Raw wrapping key, for rewrap flows. Requires installed info.
    pub fn export_wrapping_key(
        &self,
        volume: &dyn Volume,
        inode: &dyn Inode,
    ) -> HuskResult<WrappingKey> {
        if inode.crypto_slot().get().is_none() {
            return Err(HuskError::NoKey);
        }
        let policy = self.effective_policy(volume, inode)?;
        let mode = select_mode(&policy, inode.kind(), volume.supports_inline_encryption())?;
        keyring::find_wrapping_key_with_fallback(
            self.source.as_ref(),
            &self.config,
            volume.legacy_key_prefix(),
            &policy.master_key_descriptor,
            mode.key_size,
        )
    }

    /// The inode's policy, parsed and validated; the dummy stub when the
    /// volume enables it for unflagged inodes with no record.
    fn effective_policy(
        &self,
        volume: &dyn Volume,
        inode: &dyn Inode,
    ) -> HuskResult<EncryptionPolicy> {
        match volume.get_policy(inode)? {
            Some(record) => EncryptionPolicy::from_bytes(&record),
            None => {
                if !volume.dummy_policy_enabled(inode) || inode.is_encrypted() {
                    return Err(HuskError::InvalidPolicy(
                        "inode has no encryption policy record".into(),
                    ));
                }
                Ok(EncryptionPolicy::dummy(volume.supports_inline_encryption()))
            }
        }
    }

    fn build_info(
        &self,
        volume: &dyn Volume,
        inode: &dyn Inode,
        policy: &EncryptionPolicy,
    ) -> HuskResult<InodeCryptoInfo> {
        let mode = select_mode(policy, inode.kind(), volume.supports_inline_encryption())?;
        let file_key = self.resolve_file_key(volume, inode, policy, mode)?;

        // The ESSIV generator reads the file key; build it before the
        // transform takes ownership of the buffer.
        let essiv = if mode.needs_essiv {
            debug_assert_eq!(mode.iv_size, ESSIV_IV_SIZE);
            debug_assert!(!policy.uses_direct_key());
            Some(EssivGenerator::new(&file_key))
        } else {
            None
        };

        let transform = if policy.uses_direct_key() {
            KeyTransform::Shared(MasterKeyCache::get_or_create(
                &self.cache,
                self.engine.as_ref(),
                mode,
                &policy.master_key_descriptor,
                file_key,
                inode.ino(),
            )?)
        } else if mode.inline {
            KeyTransform::Inline(file_key)
        } else {
            KeyTransform::Owned(allocate_keyed_handle(
                self.engine.as_ref(),
                mode,
                file_key.as_bytes(),
                inode.ino(),
            )?)
        };

        debug!(
            ino = inode.ino(),
            mode = mode.name,
            descriptor = %policy.master_key_descriptor,
            "resolved encryption info"
        );

        Ok(InodeCryptoInfo {
            flags: policy.flags,
            mode,
            descriptor: policy.master_key_descriptor,
            nonce: policy.nonce,
            transform,
            essiv,
        })
    }

    fn resolve_file_key(
        &self,
        volume: &dyn Volume,
        inode: &dyn Inode,
        policy: &EncryptionPolicy,
        mode: &'static EncryptionMode,
    ) -> HuskResult<FileKey> {
        if inode.is_classified() {
            let Some(provider) = self.classified.as_deref() else {
                return Err(HuskError::ClassifiedDerivation(
                    "no classified key provider configured".into(),
                ));
            };
            // Classified files defer like any other while the wrapping
            // key is absent; the provider replaces only the derivation.
            keyring::find_wrapping_key_with_fallback(
                self.source.as_ref(),
                &self.config,
                volume.legacy_key_prefix(),
                &policy.master_key_descriptor,
                mode.key_size,
            )?;
            return self.classified_key(provider, inode, policy, mode);
        }

        derive::find_and_derive_key(
            self.source.as_ref(),
            &self.config,
            volume.legacy_key_prefix(),
            policy,
            mode,
        )
    }

    fn classified_key(
        &self,
        provider: &dyn ClassifiedKeyProvider,
        inode: &dyn Inode,
        policy: &EncryptionPolicy,
        mode: &'static EncryptionMode,
    ) -> HuskResult<FileKey> {
        match provider.derive_key(inode, policy, mode) {
            Ok(key) => Ok(key),
            Err(err) if err.is_no_key() => Err(err),
            Err(err) => {
                let err = match err {
                    HuskError::ClassifiedDerivation(_) => err,
                    other => HuskError::ClassifiedDerivation(other.to_string()),
                };
                if provider.is_sensitive(inode) {
                    provider.audit_failure(inode, &err);
                }
                warn!(ino = inode.ino(), %err, "classified key derivation failed");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("config", &self.config)
            .field("classified", &self.classified.is_some())
            .field("cached_keys", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::AES_256_XTS;
    use husk_core::HuskResult;

    fn stub_info(descriptor: [u8; 8]) -> InodeCryptoInfo {
        InodeCryptoInfo {
            flags: 0,
            mode: &AES_256_XTS,
            descriptor: KeyDescriptor(descriptor),
            nonce: [0; FILE_NONCE_SIZE],
            transform: KeyTransform::Inline(FileKey::from_bytes(vec![0x11; 64])),
            essiv: None,
        }
    }

    #[test]
    fn test_slot_installs_once() {
        let slot = CryptoInfoSlot::new();
        assert!(!slot.is_installed());

        assert!(slot.install(stub_info([1; 8])).is_none());
        assert!(slot.is_installed());

        // The second candidate is handed back for release.
        let loser = slot.install(stub_info([2; 8])).unwrap();
        assert_eq!(loser.descriptor(), &KeyDescriptor([2; 8]));
        assert_eq!(slot.get().unwrap().descriptor(), &KeyDescriptor([1; 8]));
    }

    #[test]
    fn test_slot_clear_is_safe_when_absent() {
        let mut slot = CryptoInfoSlot::new();
        assert!(!slot.clear());

        slot.install(stub_info([1; 8]));
        assert!(slot.clear());
        assert!(!slot.is_installed());
        assert!(!slot.clear());
    }

    #[test]
    fn test_inline_info_has_no_handle() {
        let info = stub_info([1; 8]);
        assert!(info.handle().is_none());
        assert!(matches!(info.transform(), KeyTransform::Inline(_)));
    }

    #[test]
    fn test_owned_info_reports_handle() {
        struct StubHandle;
        impl CipherHandle for StubHandle {
            fn implementation(&self) -> &str {
                "stub"
            }
            fn set_key(&mut self, _key: &[u8]) -> HuskResult<()> {
                Ok(())
            }
        }

        let info = InodeCryptoInfo {
            flags: 0,
            mode: &AES_256_XTS,
            descriptor: KeyDescriptor([3; 8]),
            nonce: [0; FILE_NONCE_SIZE],
            transform: KeyTransform::Owned(Box::new(StubHandle)),
            essiv: None,
        };
        assert_eq!(info.handle().unwrap().implementation(), "stub");
    }

    #[test]
    fn test_info_debug_omits_key_material() {
        let info = stub_info([1; 8]);
        let rendered = format!("{info:?}");
        assert!(rendered.contains("AES-256-XTS"));
        assert!(rendered.contains("Inline"));
        assert!(!rendered.contains("11"));
    }

    #[test]
    fn test_direct_key_flag_from_policy_flags() {
        let mut info = stub_info([1; 8]);
        assert!(!info.uses_direct_key());
        info.flags = POLICY_FLAG_DIRECT_KEY;
        assert!(info.uses_direct_key());
    }
}
