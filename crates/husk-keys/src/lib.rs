//! husk-keys: Per-inode encryption key setup for HuskFS
//!
//! Architecture: policy-driven key derivation with a shared-transform cache
//!
//! Pipeline: policy record → mode select → wrapping-key lookup → derive (or
//! pass through) → cipher transform (± ESSIV) → publish-once install
//!
//! Key hierarchy:
//! ```text
//! Wrapping Key (user-provisioned, named by 8-byte descriptor)
//!   ├── File Key (per-inode, AES-128-ECB of the wrapping key under the
//!   │   │         16-byte file nonce)
//!   │   └── ESSIV IV key (SHA-256 of the file key, AES-128-CBC only)
//!   ├── DIRECT_KEY: wrapping key used as-is, transform shared through
//!   │   the refcounted master-key cache
//!   └── Inline: raw key retained for the external hardware engine
//! ```

pub mod cache;
pub mod derive;
pub mod engine;
pub mod essiv;
pub mod fs;
pub mod keyring;
pub mod modes;
pub mod setup;

pub use cache::{CacheRef, MasterKeyCache};
pub use derive::{derive_file_key, FileKey};
pub use engine::{CipherEngine, CipherHandle};
pub use essiv::{EssivGenerator, ESSIV_IV_SIZE, ESSIV_SALT_SIZE};
pub use fs::{ClassifiedKeyProvider, Inode, InodeKind, Volume};
pub use keyring::{KeySource, LockedKey, ProcessKeyring, WrappingKey, KEY_RECORD_SIZE};
pub use modes::{select_mode, EncryptionMode, AVAILABLE_MODES, DIRECT_KEY_MIN_IV_SIZE};
pub use setup::{CryptoInfoSlot, InodeCryptoInfo, KeyManager, KeyTransform};
