//! Wrapping-key lookup against an external key-holding service.
//!
//! Keys are provisioned by userspace as fixed 68-byte records:
//!
//! ```text
//! offset 0   declared key length (u32 little-endian, 1..=64)
//! offset 4   raw key bytes       ([u8; 64], zero-padded past the length)
//! ```
//!
//! Lookup names are `prefix` + lowercase hex descriptor. A record that is
//! present but malformed collapses to the same caller-visible `NoKey` as
//! an absent one; deferred-key workflows depend on that uniformity. The
//! difference shows up only in the rate-limited warnings.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretSlice};
use tracing::warn;
use zeroize::Zeroizing;

use husk_core::config::KeySetupConfig;
use husk_core::policy::{KeyDescriptor, MAX_KEY_SIZE};
use husk_core::{HuskError, HuskResult};

/// Serialized wrapping-key record length in bytes.
pub const KEY_RECORD_SIZE: usize = 4 + MAX_KEY_SIZE;

/// A read-locked handle over a key-service payload. The payload stays
/// valid for the lifetime of the handle.
pub trait LockedKey {
    fn payload(&self) -> &[u8];
}

/// The external key-holding service.
pub trait KeySource: Send + Sync {
    /// Look up `name`, returning a locked handle or None when absent.
    fn lookup<'a>(&'a self, name: &str) -> HuskResult<Option<Box<dyn LockedKey + 'a>>>;
}

/// Raw wrapping-key bytes copied out of a validated record. Zeroized on
/// drop.
pub struct WrappingKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl WrappingKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes.to_vec()),
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

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappingKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Serialize a raw key into the keyring record format.
pub fn encode_key_record(raw_key: &[u8]) -> HuskResult<Vec<u8>> {
    if raw_key.is_empty() || raw_key.len() > MAX_KEY_SIZE {
        return Err(HuskError::Unsupported(format!(
            "wrapping key length {} out of range [1, {MAX_KEY_SIZE}]",
            raw_key.len()
        )));
    }
    let mut record = vec![0u8; KEY_RECORD_SIZE];
    record[..4].copy_from_slice(&(raw_key.len() as u32).to_le_bytes());
    record[4..4 + raw_key.len()].copy_from_slice(raw_key);
    Ok(record)
}

struct WarnLimiter {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl WarnLimiter {
    const fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(t) if t.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

static MALFORMED_KEY_WARN: WarnLimiter = WarnLimiter::new(Duration::from_secs(5));

fn warn_malformed(enabled: bool, name: &str, detail: fmt::Arguments<'_>) {
    if enabled && MALFORMED_KEY_WARN.allow() {
        warn!(key = name, "malformed wrapping key: {detail}");
    }
}

/// Look up the wrapping key for `descriptor` under `prefix` and validate
/// its record. Every validation failure collapses to `NoKey`.
pub fn find_wrapping_key(
    source: &dyn KeySource,
    prefix: &str,
    descriptor: &KeyDescriptor,
    min_size: usize,
    warn_malformed_keys: bool,
) -> HuskResult<WrappingKey> {
    let name = format!("{prefix}{descriptor}");
    let Some(locked) = source.lookup(&name)? else {
        return Err(HuskError::NoKey);
    };
    let payload = locked.payload();
    if payload.len() != KEY_RECORD_SIZE {
        warn_malformed(
            warn_malformed_keys,
            &name,
            format_args!("payload is {} bytes, expected {KEY_RECORD_SIZE}", payload.len()),
        );
        return Err(HuskError::NoKey);
    }
    let declared = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if !(1..=MAX_KEY_SIZE).contains(&declared) {
        warn_malformed(
            warn_malformed_keys,
            &name,
            format_args!("declared key length {declared} out of range [1, {MAX_KEY_SIZE}]"),
        );
        return Err(HuskError::NoKey);
    }
    if declared < min_size {
        warn_malformed(
            warn_malformed_keys,
            &name,
            format_args!("key is too short (got {declared} bytes, need {min_size}+)"),
        );
        return Err(HuskError::NoKey);
    }
    Ok(WrappingKey::from_bytes(&payload[4..4 + declared]))
}

/// [`find_wrapping_key`] with the primary prefix, retrying once under the
/// volume's legacy prefix when the primary lookup yields `NoKey`.
pub fn find_wrapping_key_with_fallback(
    source: &dyn KeySource,
    config: &KeySetupConfig,
    legacy_prefix: Option<&str>,
    descriptor: &KeyDescriptor,
    min_size: usize,
) -> HuskResult<WrappingKey> {
    match find_wrapping_key(
        source,
        &config.key_prefix,
        descriptor,
        min_size,
        config.warn_malformed_keys,
    ) {
        Err(HuskError::NoKey) => match legacy_prefix {
            Some(prefix) => find_wrapping_key(
                source,
                prefix,
                descriptor,
                min_size,
                config.warn_malformed_keys,
            ),
            None => Err(HuskError::NoKey),
        },
        other => other,
    }
}

/// In-process key source backed by a map. Production deployments wire a
/// real keyring service behind [`KeySource`] instead; this one covers
/// daemons that provision keys over their own control channel, and tests.
#[derive(Default)]
pub struct ProcessKeyring {
    keys: RwLock<HashMap<String, SecretSlice<u8>>>,
}

struct ProcessLockedKey<'a> {
    guard: RwLockReadGuard<'a, HashMap<String, SecretSlice<u8>>>,
    name: String,
}

impl LockedKey for ProcessLockedKey<'_> {
    fn payload(&self) -> &[u8] {
        self.guard
            .get(&self.name)
            .map(|secret| secret.expose_secret())
            .unwrap_or(&[])
    }
}

impl ProcessKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw payload under `name`, replacing any existing entry.
    pub fn insert(&self, name: impl Into<String>, payload: Vec<u8>) {
        self.keys
            .write()
            .unwrap()
            .insert(name.into(), SecretSlice::from(payload));
    }

    /// Store `raw_key` under `name` in the record format lookups expect.
    pub fn insert_raw_key(&self, name: impl Into<String>, raw_key: &[u8]) -> HuskResult<()> {
        let record = encode_key_record(raw_key)?;
        self.insert(name, record);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.keys.write().unwrap().remove(name).is_some()
    }
}

impl KeySource for ProcessKeyring {
    fn lookup<'a>(&'a self, name: &str) -> HuskResult<Option<Box<dyn LockedKey + 'a>>> {
        let guard = self.keys.read().unwrap();
        if !guard.contains_key(name) {
            return Ok(None);
        }
        Ok(Some(Box::new(ProcessLockedKey {
            guard,
            name: name.to_string(),
        })))
    }
}
