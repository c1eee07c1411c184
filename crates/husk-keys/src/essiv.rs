//! ESSIV IV transform setup.
//!
//! Narrow-block chaining modes (AES-128-CBC here) need IVs an attacker
//! cannot predict from the block number alone. ESSIV hashes the file key
//! into a salt, keys an AES-256 block cipher with the salt, and runs
//! every block-number IV through that cipher before use.

use std::fmt;
use std::sync::OnceLock;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::derive::FileKey;

/// Salt length: SHA-256 output, which keys the AES-256 transform.
pub const ESSIV_SALT_SIZE: usize = 32;

/// Block length of the IV transform.
pub const ESSIV_IV_SIZE: usize = 16;

/// Process-wide hash template, published at most once. A caller racing
/// the first initialization drops its own candidate and uses the winner.
static ESSIV_HASHER: OnceLock<Sha256> = OnceLock::new();

fn essiv_hasher() -> &'static Sha256 {
    if let Some(hasher) = ESSIV_HASHER.get() {
        return hasher;
    }
    let _ = ESSIV_HASHER.set(Sha256::new());
    ESSIV_HASHER.get().expect("hash template was just published")
}

fn derive_salt(key: &[u8]) -> Zeroizing<[u8; ESSIV_SALT_SIZE]> {
    let mut hasher = essiv_hasher().clone();
    hasher.update(key);
    let mut salt = Zeroizing::new([0u8; ESSIV_SALT_SIZE]);
    hasher.finalize_into((&mut *salt).into());
    salt
}

/// Keyed IV transform for one file.
pub struct EssivGenerator {
    cipher: Aes256,
}

impl EssivGenerator {
    /// Key the transform with the SHA-256 digest of `key`. The salt is a
    /// transient buffer, wiped once the cipher is keyed.
    pub fn new(key: &FileKey) -> Self {
        let salt = derive_salt(key.as_bytes());
        Self {
            cipher: Aes256::new((&*salt).into()),
        }
    }

    /// Encrypt one IV block in place.
    pub fn transform_iv(&self, iv: &mut [u8; ESSIV_IV_SIZE]) {
        self.cipher.encrypt_block(GenericArray::from_mut_slice(iv));
    }

    /// The transformed IV for a block number, which is placed
    /// little-endian in the low eight bytes before encryption.
    pub fn iv_for_block(&self, block: u64) -> [u8; ESSIV_IV_SIZE] {
        let mut iv = [0u8; ESSIV_IV_SIZE];
        iv[..8].copy_from_slice(&block.to_le_bytes());
        self.transform_iv(&mut iv);
        iv
    }
}

impl fmt::Debug for EssivGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EssivGenerator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_salt_is_sha256_of_file_key() {
        let key = FileKey::from_bytes(vec![0x3c; 16]);
        let generator = EssivGenerator::new(&key);
        let mut iv = [0u8; ESSIV_IV_SIZE];
        generator.transform_iv(&mut iv);

        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256::new(&digest);
        let mut expected = [0u8; ESSIV_IV_SIZE];
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut expected));

        assert_eq!(iv, expected);
    }

    #[test]
    fn test_same_key_gives_same_ivs() {
        let key = FileKey::from_bytes(vec![0x77; 16]);
        let a = EssivGenerator::new(&key);
        let b = EssivGenerator::new(&key);
        assert_eq!(a.iv_for_block(5), b.iv_for_block(5));
    }

    #[test]
    fn test_different_keys_give_different_ivs() {
        let a = EssivGenerator::new(&FileKey::from_bytes(vec![0x01; 16]));
        let b = EssivGenerator::new(&FileKey::from_bytes(vec![0x02; 16]));
        assert_ne!(a.iv_for_block(5), b.iv_for_block(5));
    }

    #[test]
    fn test_block_number_changes_iv() {
        let generator = EssivGenerator::new(&FileKey::from_bytes(vec![0x09; 16]));
        assert_ne!(generator.iv_for_block(0), generator.iv_for_block(1));
    }

    #[test]
    fn test_hash_template_publishes_once() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| essiv_hasher() as *const Sha256 as usize))
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.iter().all(|a| *a == addrs[0]));
    }
}
