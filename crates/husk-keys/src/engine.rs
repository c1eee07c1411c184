//! Seam to the external bulk cipher engine.
//!
//! The engine performs the actual contents/filenames encryption; this
//! crate only allocates transforms from it and installs keys into them.

use tracing::warn;

use husk_core::HuskResult;

use crate::modes::EncryptionMode;

/// A keyed cipher transform owned by this crate or shared through the
/// master-key cache.
pub trait CipherHandle: Send + Sync {
    /// Implementation name reported by the engine, for diagnostics.
    fn implementation(&self) -> &str;

    /// Install the key material. Called exactly once, before the handle
    /// is shared.
    fn set_key(&mut self, key: &[u8]) -> HuskResult<()>;
}

pub trait CipherEngine: Send + Sync {
    /// Allocate an unkeyed transform for the given cipher identifier
    /// (e.g. "xts(aes)"). May block; never called under a lock.
    fn allocate(&self, cipher: &str) -> HuskResult<Box<dyn CipherHandle>>;
}

/// Allocate a transform for `mode` and key it with `raw_key`, logging the
/// backing implementation the first time each mode is instantiated.
pub fn allocate_keyed_handle(
    engine: &dyn CipherEngine,
    mode: &'static EncryptionMode,
    raw_key: &[u8],
    ino: u64,
) -> HuskResult<Box<dyn CipherHandle>> {
    debug_assert_eq!(raw_key.len(), mode.key_size);
    let mut handle = engine.allocate(mode.cipher).map_err(|e| {
        warn!(ino, cipher = mode.cipher, "error allocating cipher transform: {e}");
        e
    })?;
    mode.log_implementation(handle.implementation());
    handle.set_key(raw_key)?;
    Ok(handle)
}
