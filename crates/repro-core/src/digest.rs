use sha2::{Digest, Sha256};

use crate::model::ContentHash;

/// Size of the chunks uploads are read and hashed in.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Incremental SHA-256 that also counts the bytes it has seen.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> ContentHash {
        ContentHash::from_digest(&self.inner.finalize())
    }
}
