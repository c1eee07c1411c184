//! Process-wide cache of shared cipher transforms.
//!
//! DIRECT_KEY policies feed the wrapping key straight into the cipher, so
//! every file under the same key and mode can share one keyed transform
//! instead of allocating its own. Entries are refcounted; dropping the
//! last reference unlinks the entry and tears the transform down.
//!
//! Lookups hash only the key descriptor. Hashing secret key bytes would
//! let a probe measure bucket placement through collision timing, so the
//! key itself is compared in constant time, and only after descriptor and
//! mode already match.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use subtle::ConstantTimeEq;
use tracing::debug;

use husk_core::policy::KeyDescriptor;
use husk_core::HuskResult;

use crate::derive::FileKey;
use crate::engine::{allocate_keyed_handle, CipherEngine, CipherHandle};
use crate::modes::EncryptionMode;

const BUCKET_BITS: u32 = 6;
const BUCKET_COUNT: usize = 1 << BUCKET_BITS;

// Fibonacci hashing multiplier, 2^64 divided by the golden ratio.
const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// One shared keyed transform, alive while any [`CacheRef`] points at it.
pub struct MasterKeyEntry {
    descriptor: KeyDescriptor,
    mode: &'static EncryptionMode,
    key: FileKey,
    handle: Box<dyn CipherHandle>,
    refcount: AtomicU32,
}

impl MasterKeyEntry {
    fn matches(
        &self,
        descriptor: &KeyDescriptor,
        mode: &'static EncryptionMode,
        key: &[u8],
    ) -> bool {
        if self.descriptor != *descriptor || !std::ptr::eq(self.mode, mode) {
            return false;
        }
        // Key length is fixed by the mode and therefore public; the bytes
        // are not.
        self.key.len() == key.len() && bool::from(self.key.as_bytes().ct_eq(key))
    }
}

type Bucket = Vec<Arc<MasterKeyEntry>>;

/// Refcounted table of shared transforms, bucketed by key descriptor.
///
/// A single lock guards the whole table. Refcounts only change under it;
/// transform allocation and teardown always happen outside it.
pub struct MasterKeyCache {
    table: Mutex<[Bucket; BUCKET_COUNT]>,
}

impl Default for MasterKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterKeyCache {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    fn bucket_index(descriptor: &KeyDescriptor) -> usize {
        (descriptor.to_u64().wrapping_mul(GOLDEN_RATIO_64) >> (64 - BUCKET_BITS)) as usize
    }

    /// Find the shared transform for `(descriptor, mode, key)`, allocating
    /// and keying one through `engine` on a miss.
    ///
    /// When two setups race on the same key, one transform wins the table
    /// and the loser is torn down after the lock is released; both callers
    /// get a reference to the winner.
    pub fn get_or_create(
        cache: &Arc<Self>,
        engine: &dyn CipherEngine,
        mode: &'static EncryptionMode,
        descriptor: &KeyDescriptor,
        key: FileKey,
        ino: u64,
    ) -> HuskResult<CacheRef> {
        if let Some(entry) = cache.find(descriptor, mode, key.as_bytes()) {
            return Ok(CacheRef {
                cache: Arc::clone(cache),
                entry,
            });
        }

        let handle = allocate_keyed_handle(engine, mode, key.as_bytes(), ino)?;
        let candidate = Arc::new(MasterKeyEntry {
            descriptor: *descriptor,
            mode,
            key,
            handle,
            refcount: AtomicU32::new(1),
        });

        let entry = {
            let mut table = cache.table.lock().unwrap();
            let bucket = &mut table[Self::bucket_index(descriptor)];
            match bucket
                .iter()
                .find(|e| e.matches(descriptor, mode, candidate.key.as_bytes()))
            {
                Some(existing) => {
                    existing.refcount.fetch_add(1, Ordering::Relaxed);
                    Arc::clone(existing)
                }
                None => {
                    bucket.push(Arc::clone(&candidate));
                    Arc::clone(&candidate)
                }
            }
        };
        if !Arc::ptr_eq(&entry, &candidate) {
            debug!(
                descriptor = %descriptor,
                mode = mode.name,
                "lost transform insertion race, reusing winner"
            );
        }
        // A losing candidate (and its keyed transform) drops here, with
        // the table lock already released.
        drop(candidate);

        Ok(CacheRef {
            cache: Arc::clone(cache),
            entry,
        })
    }

    fn find(
        &self,
        descriptor: &KeyDescriptor,
        mode: &'static EncryptionMode,
        key: &[u8],
    ) -> Option<Arc<MasterKeyEntry>> {
        let table = self.table.lock().unwrap();
        let entry = table[Self::bucket_index(descriptor)]
            .iter()
            .find(|e| e.matches(descriptor, mode, key))?;
        entry.refcount.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(entry))
    }

    fn release(&self, entry: &Arc<MasterKeyEntry>) {
        let mut table = self.table.lock().unwrap();
        if entry.refcount.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        // Last reference: unlink before unlocking so no lookup can find
        // the entry again. The transform itself drops with the caller's
        // Arc, outside the lock.
        table[Self::bucket_index(&entry.descriptor)].retain(|e| !Arc::ptr_eq(e, entry));
        drop(table);
        debug!(
            descriptor = %entry.descriptor,
            mode = entry.mode.name,
            "unlinked shared transform"
        );
    }

    /// Number of live entries across all buckets.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when any live entry was keyed under `descriptor`.
    pub fn contains_descriptor(&self, descriptor: &KeyDescriptor) -> bool {
        self.table.lock().unwrap()[Self::bucket_index(descriptor)]
            .iter()
            .any(|e| e.descriptor == *descriptor)
    }
}

/// A counted reference to a shared transform. Dropping it releases the
/// reference and unlinks the entry when it was the last one.
pub struct CacheRef {
    cache: Arc<MasterKeyCache>,
    entry: Arc<MasterKeyEntry>,
}

impl CacheRef {
    pub fn handle(&self) -> &dyn CipherHandle {
        self.entry.handle.as_ref()
    }

    pub fn key(&self) -> &FileKey {
        &self.entry.key
    }

    pub fn mode(&self) -> &'static EncryptionMode {
        self.entry.mode
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.entry.descriptor
    }

    /// True when both references point at the same cached transform.
    pub fn shares_entry(&self, other: &CacheRef) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Drop for CacheRef {
    fn drop(&mut self) {
        self.cache.release(&self.entry);
    }
}

impl fmt::Debug for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("descriptor", &self.entry.descriptor)
            .field("mode", &self.entry.mode.name)
            .finish()
    }
}
