//! Counter-mode block cipher transform applied to chunks in the pipeline.
//!
//! Every file encrypted under a content key gets its own 64-bit
//! initialization vector. The keystream for the 16-byte cipher block at
//! file position `n * 16` is `AES-256(key, IV || n)`, where `IV` and `n`
//! are big-endian 64-bit integers. Because the keystream position is
//! derived from the file offset alone, chunks can be transformed in any
//! order and need not be aligned to the cipher block size.
//!
//! A transform instance is not safe for concurrent use, so each
//! [`FileEncryption`] serializes access behind its own lock. Code that also
//! holds a per-destination-file lock must take the encryption lock first
//! and the file lock second.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use rand::{Rng, RngCore};
use tokio::sync::MutexGuard;

use crate::TransferError;

/// Content key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Cipher block length in bytes.
pub const CIPHER_BLOCK_LEN: usize = 16;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Symmetric content key shared by all files of one asset.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransferError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            TransferError::Encryption(format!(
                "content key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Generates a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

/// Builds the counter block for cipher block `block_index` of a file.
pub fn counter_block(iv: u64, block_index: u64) -> [u8; CIPHER_BLOCK_LEN] {
    let mut block = [0u8; CIPHER_BLOCK_LEN];
    block[..8].copy_from_slice(&iv.to_be_bytes());
    block[8..].copy_from_slice(&block_index.to_be_bytes());
    block
}

/// Hands out initialization vectors unique among the files of one key.
#[derive(Debug, Default)]
pub struct IvRegistry {
    used: Mutex<HashSet<u64>>,
}

impl IvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a random IV that no other file in this registry uses.
    pub fn allocate(&self) -> u64 {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();
        loop {
            let iv = rng.next_u64();
            if used.insert(iv) {
                return iv;
            }
        }
    }

    /// Records an IV chosen elsewhere. Returns `false` if it is already taken.
    pub fn reserve(&self, iv: u64) -> bool {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(iv)
    }

    pub fn contains(&self, iv: u64) -> bool {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&iv)
    }

    pub fn len(&self) -> usize {
        self.used.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-file encryption state: the file's IV and its locked transform.
pub struct FileEncryption {
    iv: u64,
    transform: tokio::sync::Mutex<Aes256Ctr>,
}

impl FileEncryption {
    pub fn new(key: &ContentKey, iv: u64) -> Result<Self, TransferError> {
        let cipher = Aes256Ctr::new_from_slices(key.as_bytes(), &counter_block(iv, 0))
            .map_err(|e| TransferError::Encryption(e.to_string()))?;
        Ok(Self {
            iv,
            transform: tokio::sync::Mutex::new(cipher),
        })
    }

    /// Creates the state for a new file with an IV drawn from `registry`.
    pub fn for_new_file(key: &ContentKey, registry: &IvRegistry) -> Result<Self, TransferError> {
        Self::new(key, registry.allocate())
    }

    pub fn iv(&self) -> u64 {
        self.iv
    }

    /// Acquires the file's transform lock.
    pub async fn lock(&self) -> Transform<'_> {
        Transform {
            cipher: self.transform.lock().await,
        }
    }

    /// Transforms `data` in place, treating it as the bytes at `file_offset`.
    ///
    /// Encryption and decryption are the same operation.
    pub async fn apply(&self, file_offset: u64, data: &mut [u8]) -> Result<(), TransferError> {
        self.lock().await.apply(file_offset, data)
    }
}

impl fmt::Debug for FileEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEncryption")
            .field("iv", &format_args!("{:#018x}", self.iv))
            .finish()
    }
}

/// Exclusive access to a file's transform.
pub struct Transform<'a> {
    cipher: MutexGuard<'a, Aes256Ctr>,
}

impl Transform<'_> {
    pub fn apply(&mut self, file_offset: u64, data: &mut [u8]) -> Result<(), TransferError> {
        self.cipher
            .try_seek(file_offset)
            .map_err(|e| TransferError::Encryption(e.to_string()))?;
        self.cipher
            .try_apply_keystream(data)
            .map_err(|e| TransferError::Encryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{BlockEncrypt, KeyInit};

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn chunk_roundtrip_unaligned_blocks() {
        let key = ContentKey::generate();
        let enc = FileEncryption::new(&key, 0x0123_4567_89ab_cdef).unwrap();
        let plain = sample(1000);

        // 37 is deliberately not a multiple of the cipher block.
        for block_size in [16usize, 37, 100] {
            let mut data = plain.clone();
            for (i, chunk) in data.chunks_mut(block_size).enumerate() {
                enc.apply((i * block_size) as u64, chunk).await.unwrap();
            }
            assert_ne!(data, plain);
            for (i, chunk) in data.chunks_mut(block_size).enumerate() {
                enc.apply((i * block_size) as u64, chunk).await.unwrap();
            }
            assert_eq!(data, plain);
        }
    }

    #[tokio::test]
    async fn chunking_does_not_change_ciphertext() {
        let key = ContentKey::generate();
        let enc = FileEncryption::new(&key, 42).unwrap();
        let plain = sample(500);

        let mut whole = plain.clone();
        enc.apply(0, &mut whole).await.unwrap();

        let mut pieces = plain.clone();
        // Out of order on purpose.
        let (a, rest) = pieces.split_at_mut(123);
        let (b, c) = rest.split_at_mut(200);
        enc.apply(323, c).await.unwrap();
        enc.apply(0, a).await.unwrap();
        enc.apply(123, b).await.unwrap();

        assert_eq!(whole, pieces);
    }

    #[tokio::test]
    async fn keystream_is_iv_then_block_index() {
        let key = ContentKey::from_bytes([7u8; KEY_LEN]);
        let iv = 0xdead_beef_0000_0001;
        let enc = FileEncryption::new(&key, iv).unwrap();

        // Keystream of cipher block 3 is the encryption of IV || 3.
        let mut data = [0u8; CIPHER_BLOCK_LEN];
        enc.apply(3 * CIPHER_BLOCK_LEN as u64, &mut data).await.unwrap();

        let aes = Aes256::new_from_slice(key.as_bytes()).unwrap();
        let mut expected = aes::Block::clone_from_slice(&counter_block(iv, 3));
        aes.encrypt_block(&mut expected);
        assert_eq!(data.as_slice(), expected.as_slice());
    }

    #[tokio::test]
    async fn different_ivs_give_different_ciphertext() {
        let key = ContentKey::generate();
        let a = FileEncryption::new(&key, 1).unwrap();
        let b = FileEncryption::new(&key, 2).unwrap();
        let mut x = sample(64);
        let mut y = sample(64);
        a.apply(0, &mut x).await.unwrap();
        b.apply(0, &mut y).await.unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn registry_never_repeats() {
        let registry = IvRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(registry.allocate()));
        }
        assert_eq!(registry.len(), 1000);
    }

    #[test]
    fn registry_reserve_detects_collision() {
        let registry = IvRegistry::new();
        assert!(registry.reserve(9));
        assert!(!registry.reserve(9));
        assert!(registry.contains(9));
    }

    #[test]
    fn content_key_length_checked() {
        assert!(ContentKey::from_slice(&[0u8; 16]).is_err());
        assert!(ContentKey::from_slice(&[0u8; KEY_LEN]).is_ok());
        assert!(!format!("{:?}", ContentKey::generate()).contains('['));
    }

    #[test]
    fn counter_block_layout() {
        let block = counter_block(0x0102_0304_0506_0708, 0x0a);
        assert_eq!(&block[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&block[8..], &[0, 0, 0, 0, 0, 0, 0, 0x0a]);
    }
}
