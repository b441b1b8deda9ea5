// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

//! SHA-256 with an exportable intermediate state.
//!
//! The running payload hash must survive process restarts, so its state is
//! persisted alongside the rest of the checkpoint. Neither ring nor the
//! high-level sha2 API expose their internal state, so the message schedule
//! is driven directly through [`sha2::compress256`].

use std::fmt;

use sha2::digest::{consts::U64, generic_array::GenericArray};
use thiserror::Error;

const BLOCK_SIZE: usize = 64;
pub const DIGEST_SIZE: usize = 32;

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Size of the fixed portion of the serialized state: the chaining words, the
/// total length, and the partial block length.
const SERIALIZED_FIXED_SIZE: usize = 8 * 4 + 8 + 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash context is too short: {0} bytes")]
    Truncated(usize),
    #[error("Hash context partial block length {0} exceeds block size")]
    InvalidPartialLength(u8),
    #[error("Hash context size should be {expected} bytes, but is {actual} bytes")]
    InvalidSize { expected: usize, actual: usize },
    #[error("Hash context total length {total} is inconsistent with partial length {partial}")]
    InconsistentLength { total: u64, partial: u8 },
}

type Result<T> = std::result::Result<T, Error>;

/// A SHA-256 hasher whose state can be saved with [`Self::to_bytes()`] and
/// restored with [`Self::from_bytes()`].
#[derive(Clone, PartialEq, Eq)]
pub struct HashContext {
    state: [u32; 8],
    block: [u8; BLOCK_SIZE],
    block_len: usize,
    total_len: u64,
}

impl fmt::Debug for HashContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashContext")
            .field("state", &format_args!("{:08x?}", self.state))
            .field("block_len", &self.block_len)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

impl Default for HashContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HashContext {
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            block: [0u8; BLOCK_SIZE],
            block_len: 0,
            total_len: 0,
        }
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    fn compress(state: &mut [u32; 8], block: &[u8]) {
        let block = GenericArray::<u8, U64>::from_slice(block);
        sha2::compress256(state, std::slice::from_ref(block));
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len += data.len() as u64;

        if self.block_len > 0 {
            let n = data.len().min(BLOCK_SIZE - self.block_len);
            self.block[self.block_len..self.block_len + n].copy_from_slice(&data[..n]);
            self.block_len += n;
            data = &data[n..];

            if self.block_len < BLOCK_SIZE {
                return;
            }

            Self::compress(&mut self.state, &self.block);
            self.block_len = 0;
        }

        let mut chunks = data.chunks_exact(BLOCK_SIZE);
        for chunk in &mut chunks {
            Self::compress(&mut self.state, chunk);
        }

        let remainder = chunks.remainder();
        self.block[..remainder.len()].copy_from_slice(remainder);
        self.block_len = remainder.len();
    }

    /// Apply the final padding and return the digest.
    pub fn finish(mut self) -> [u8; DIGEST_SIZE] {
        let bit_len = self.total_len.wrapping_mul(8);

        self.block[self.block_len] = 0x80;
        self.block_len += 1;

        if self.block_len > BLOCK_SIZE - 8 {
            self.block[self.block_len..].fill(0);
            Self::compress(&mut self.state, &self.block);
            self.block_len = 0;
        }

        self.block[self.block_len..BLOCK_SIZE - 8].fill(0);
        self.block[BLOCK_SIZE - 8..].copy_from_slice(&bit_len.to_be_bytes());
        Self::compress(&mut self.state, &self.block);

        let mut digest = [0u8; DIGEST_SIZE];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(self.state) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        digest
    }

    /// Serialize the intermediate state.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(SERIALIZED_FIXED_SIZE + self.block_len);

        for word in self.state {
            result.extend_from_slice(&word.to_be_bytes());
        }
        result.extend_from_slice(&self.total_len.to_be_bytes());
        // Always fits since block_len < 64.
        result.push(self.block_len as u8);
        result.extend_from_slice(&self.block[..self.block_len]);

        result
    }

    /// Restore an intermediate state produced by [`Self::to_bytes()`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SERIALIZED_FIXED_SIZE {
            return Err(Error::Truncated(data.len()));
        }

        let (words, rest) = data.split_at(8 * 4);
        let (total_len, rest) = rest.split_at(8);
        let (block_len, rest) = rest.split_at(1);

        let block_len = block_len[0];
        if usize::from(block_len) >= BLOCK_SIZE {
            return Err(Error::InvalidPartialLength(block_len));
        }

        if rest.len() != usize::from(block_len) {
            return Err(Error::InvalidSize {
                expected: SERIALIZED_FIXED_SIZE + usize::from(block_len),
                actual: data.len(),
            });
        }

        let total_len = u64::from_be_bytes(total_len.try_into().unwrap());
        if total_len % BLOCK_SIZE as u64 != u64::from(block_len) {
            return Err(Error::InconsistentLength {
                total: total_len,
                partial: block_len,
            });
        }

        let mut state = [0u32; 8];
        for (word, chunk) in state.iter_mut().zip(words.chunks_exact(4)) {
            *word = u32::from_be_bytes(chunk.try_into().unwrap());
        }

        let mut block = [0u8; BLOCK_SIZE];
        block[..rest.len()].copy_from_slice(rest);

        Ok(Self {
            state,
            block,
            block_len: usize::from(block_len),
            total_len,
        })
    }
}

/// One-shot SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; DIGEST_SIZE] {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    let mut result = [0u8; DIGEST_SIZE];
    result.copy_from_slice(digest.as_ref());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_sha256(data: &[u8]) -> Vec<u8> {
        ring::digest::digest(&ring::digest::SHA256, data)
            .as_ref()
            .to_vec()
    }

    #[test]
    fn empty_input() {
        assert_eq!(
            hex::encode(HashContext::new().finish()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );
    }

    #[test]
    fn matches_ring_across_padding_boundaries() {
        let data = (0..300u32).map(|i| (i * 7) as u8).collect::<Vec<_>>();

        for len in [1, 55, 56, 63, 64, 65, 119, 120, 128, 300] {
            let mut context = HashContext::new();
            context.update(&data[..len]);

            assert_eq!(context.finish().as_slice(), ring_sha256(&data[..len]), "{len}");
        }
    }

    #[test]
    fn split_updates() {
        let data = b"The quick brown fox jumps over the lazy dog".repeat(10);

        for split in [0, 1, 63, 64, 65, 200, data.len()] {
            let mut context = HashContext::new();
            context.update(&data[..split]);
            context.update(&data[split..]);

            assert_eq!(context.finish().as_slice(), ring_sha256(&data));
        }
    }

    #[test]
    fn save_and_restore() {
        let data = b"abcdefghij".repeat(50);

        for split in [0, 10, 64, 100, 499] {
            let mut context = HashContext::new();
            context.update(&data[..split]);

            let saved = context.to_bytes();
            let mut restored = HashContext::from_bytes(&saved).unwrap();
            assert_eq!(restored, context);

            restored.update(&data[split..]);
            assert_eq!(restored.finish().as_slice(), ring_sha256(&data));
        }
    }

    #[test]
    fn reject_corrupt_state() {
        let mut context = HashContext::new();
        context.update(b"foo");
        let saved = context.to_bytes();

        assert!(matches!(
            HashContext::from_bytes(&saved[..10]),
            Err(Error::Truncated(10))
        ));
        assert!(matches!(
            HashContext::from_bytes(&saved[..saved.len() - 1]),
            Err(Error::InvalidSize { .. })
        ));

        let mut bad_len = saved.clone();
        bad_len[39] = 4;
        assert!(matches!(
            HashContext::from_bytes(&bad_len),
            Err(Error::InconsistentLength {
                total: 4,
                partial: 3
            })
        ));

        let mut bad_partial = saved;
        bad_partial[40] = 64;
        assert!(matches!(
            HashContext::from_bytes(&bad_partial),
            Err(Error::InvalidPartialLength(64))
        ));
    }
}
