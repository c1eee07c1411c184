//! On-disk encryption policy record.
//!
//! Every encrypted directory tree stores a fixed 28-byte record in volume
//! metadata describing how files beneath it are encrypted:
//!
//! ```text
//! offset 0   version           (u8, currently 1)
//! offset 1   contents mode     (u8 wire id)
//! offset 2   filenames mode    (u8 wire id)
//! offset 3   flags             (u8 bit mask)
//! offset 4   key descriptor    ([u8; 8], selects the wrapping key)
//! offset 12  file nonce        ([u8; 16], unique per inode)
//! ```
//!
//! Parsing validates only version, length, and flags. Whether the mode
//! bytes name real, mutually compatible algorithms is decided by the mode
//! registry at key-setup time, so old volumes with modes this build does
//! not carry still parse and fail with a precise error later.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use crate::error::{HuskError, HuskResult};

/// Serialized policy record length in bytes.
pub const POLICY_RECORD_SIZE: usize = 28;

/// The only policy version this build understands.
pub const POLICY_VERSION: u8 = 1;

/// Wrapping-key descriptor length in bytes.
pub const KEY_DESCRIPTOR_SIZE: usize = 8;

/// Per-inode nonce length in bytes.
pub const FILE_NONCE_SIZE: usize = 16;

/// Upper bound on raw wrapping-key payload length, in bytes.
pub const MAX_KEY_SIZE: usize = 64;

/// Upper bound on any mode's IV length, in bytes.
pub const MAX_IV_SIZE: usize = 32;

// Policy flag bits. The low two bits select filename padding; bit 2
// requests direct use of the wrapping key as the file key.
pub const POLICY_FLAGS_PAD_4: u8 = 0x00;
pub const POLICY_FLAGS_PAD_8: u8 = 0x01;
pub const POLICY_FLAGS_PAD_16: u8 = 0x02;
pub const POLICY_FLAGS_PAD_32: u8 = 0x03;
pub const POLICY_FLAGS_PAD_MASK: u8 = 0x03;
pub const POLICY_FLAG_DIRECT_KEY: u8 = 0x04;
pub const POLICY_FLAGS_VALID: u8 = 0x07;

// Wire ids for encryption modes. These are stable on-disk values; the
// gaps are modes that were retired before this implementation.
pub const MODE_AES_256_XTS: u8 = 1;
pub const MODE_AES_256_CTS: u8 = 4;
pub const MODE_AES_128_CBC: u8 = 5;
pub const MODE_AES_128_CTS: u8 = 6;
pub const MODE_ADIANTUM: u8 = 9;
/// Hardware-managed inline mode. The engine programs the key into the
/// storage controller instead of running a software cipher.
pub const MODE_PRIVATE: u8 = 127;

/// Identifies a wrapping key. Not secret; appears in log output and
/// keyring lookup strings as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyDescriptor(pub [u8; KEY_DESCRIPTOR_SIZE]);

impl KeyDescriptor {
    pub fn as_bytes(&self) -> &[u8; KEY_DESCRIPTOR_SIZE] {
        &self.0
    }

    /// Little-endian integer form, used for cache bucketing.
    pub fn to_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDescriptor({self})")
    }
}

impl FromStr for KeyDescriptor {
    type Err = HuskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 * KEY_DESCRIPTOR_SIZE {
            return Err(HuskError::InvalidPolicy(format!(
                "key descriptor must be {} hex digits, got {}",
                2 * KEY_DESCRIPTOR_SIZE,
                bytes.len()
            )));
        }
        let mut out = [0u8; KEY_DESCRIPTOR_SIZE];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_val(pair[0])?;
            let lo = hex_val(pair[1])?;
            out[i] = (hi << 4) | lo;
        }
        Ok(KeyDescriptor(out))
    }
}

fn hex_val(c: u8) -> HuskResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HuskError::InvalidPolicy(format!(
            "invalid hex digit {:?} in key descriptor",
            c as char
        ))),
    }
}

/// A parsed policy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionPolicy {
    pub version: u8,
    pub contents_mode: u8,
    pub filenames_mode: u8,
    pub flags: u8,
    pub master_key_descriptor: KeyDescriptor,
    pub nonce: [u8; FILE_NONCE_SIZE],
}

impl EncryptionPolicy {
    /// Build a policy for a new inode with a freshly generated nonce.
    pub fn new(
        contents_mode: u8,
        filenames_mode: u8,
        flags: u8,
        master_key_descriptor: KeyDescriptor,
    ) -> Self {
        let mut nonce = [0u8; FILE_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            version: POLICY_VERSION,
            contents_mode,
            filenames_mode,
            flags,
            master_key_descriptor,
            nonce,
        }
    }

    /// The fixed record substituted for unencrypted inodes when the
    /// volume runs in test mode with no stored policies. The 0x42
    /// descriptor marks the stub; inline-capable volumes encrypt
    /// contents through the hardware mode.
    pub fn dummy(inline: bool) -> Self {
        Self {
            version: POLICY_VERSION,
            contents_mode: if inline { MODE_PRIVATE } else { MODE_AES_256_XTS },
            filenames_mode: MODE_AES_256_CTS,
            flags: 0,
            master_key_descriptor: KeyDescriptor([0x42; KEY_DESCRIPTOR_SIZE]),
            nonce: [0u8; FILE_NONCE_SIZE],
        }
    }

    /// Parse a record exactly as stored. Rejects wrong length, unknown
    /// version, and flag bits outside the valid mask.
    pub fn from_bytes(raw: &[u8]) -> HuskResult<Self> {
        if raw.len() != POLICY_RECORD_SIZE {
            return Err(HuskError::InvalidPolicy(format!(
                "record is {} bytes, expected {}",
                raw.len(),
                POLICY_RECORD_SIZE
            )));
        }
        if raw[0] != POLICY_VERSION {
            return Err(HuskError::InvalidPolicy(format!(
                "unknown policy version {}",
                raw[0]
            )));
        }
        if raw[3] & !POLICY_FLAGS_VALID != 0 {
            return Err(HuskError::InvalidPolicy(format!(
                "invalid policy flags {:#04x}",
                raw[3]
            )));
        }
        let mut descriptor = [0u8; KEY_DESCRIPTOR_SIZE];
        descriptor.copy_from_slice(&raw[4..4 + KEY_DESCRIPTOR_SIZE]);
        let mut nonce = [0u8; FILE_NONCE_SIZE];
        nonce.copy_from_slice(&raw[12..12 + FILE_NONCE_SIZE]);
        Ok(Self {
            version: raw[0],
            contents_mode: raw[1],
            filenames_mode: raw[2],
            flags: raw[3],
            master_key_descriptor: KeyDescriptor(descriptor),
            nonce,
        })
    }

    pub fn to_bytes(&self) -> [u8; POLICY_RECORD_SIZE] {
        let mut out = [0u8; POLICY_RECORD_SIZE];
        out[0] = self.version;
        out[1] = self.contents_mode;
        out[2] = self.filenames_mode;
        out[3] = self.flags;
        out[4..12].copy_from_slice(&self.master_key_descriptor.0);
        out[12..28].copy_from_slice(&self.nonce);
        out
    }

    /// True when the wrapping key is used directly as the file key.
    pub fn uses_direct_key(&self) -> bool {
        self.flags & POLICY_FLAG_DIRECT_KEY != 0
    }

    /// Filename padding in bytes selected by the low flag bits.
    pub fn filenames_padding(&self) -> usize {
        4 << (self.flags & POLICY_FLAGS_PAD_MASK)
    }
}
