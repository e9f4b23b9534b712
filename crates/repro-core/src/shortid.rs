//! Reversible, namespaced obfuscation of sequential ids.
//!
//! An id is permuted with a keyed 4-round Feistel network over its two 32-bit
//! halves and followed by a 32-bit tag, both keyed per namespace from the
//! deployment salt. The output is 24 lowercase hex characters, so it can sit
//! in a DNS label next to a `-<port>` suffix.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Namespace of run ids, the ones carried in public proxy hostnames.
pub const RUN_NAMESPACE: &str = "run";

const KEY_CONTEXT: &[u8] = b"repro.shortid.v1/";
const ROUNDS: u8 = 4;
const BLOCK_LEN: usize = 8;
const TAG_LEN: usize = 4;
pub const ENCODED_LEN: usize = (BLOCK_LEN + TAG_LEN) * 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShortIdError {
    #[error("malformed short id")]
    Malformed,
    /// Well-formed, but not produced by this salt and namespace.
    #[error("short id does not match namespace")]
    Mismatch,
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),
    #[error("short id salt must not be empty")]
    EmptySalt,
}

/// One salt, several namespaces. Immutable once built; share it behind an `Arc`.
#[derive(Clone)]
pub struct ShortIdCodec {
    keys: BTreeMap<String, HmacSha256>,
}

impl fmt::Debug for ShortIdCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShortIdCodec")
            .field("namespaces", &self.keys.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ShortIdCodec {
    pub fn new<I, S>(salt: &[u8], namespaces: I) -> Result<Self, ShortIdError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if salt.is_empty() {
            return Err(ShortIdError::EmptySalt);
        }
        let mut keys = BTreeMap::new();
        for ns in namespaces {
            let ns = ns.as_ref();
            let mut derive = keyed(salt)?;
            derive.update(KEY_CONTEXT);
            derive.update(ns.as_bytes());
            let ns_key = derive.finalize().into_bytes();
            keys.insert(ns.to_string(), keyed(&ns_key)?);
        }
        Ok(Self { keys })
    }

    pub fn encode(&self, namespace: &str, id: u64) -> Result<String, ShortIdError> {
        let key = self.key(namespace)?;

        let (mut left, mut right) = ((id >> 32) as u32, id as u32);
        for round in 0..ROUNDS {
            let next = left ^ round_fn(key, round, right);
            left = right;
            right = next;
        }
        let block = ((u64::from(left) << 32) | u64::from(right)).to_be_bytes();

        let mut out = Vec::with_capacity(BLOCK_LEN + TAG_LEN);
        out.extend_from_slice(&block);
        out.extend_from_slice(&tag(key, &block).finalize().into_bytes()[..TAG_LEN]);
        Ok(hex::encode(out))
    }

    pub fn decode(&self, namespace: &str, encoded: &str) -> Result<u64, ShortIdError> {
        let key = self.key(namespace)?;

        if encoded.len() != ENCODED_LEN {
            return Err(ShortIdError::Malformed);
        }
        let raw = hex::decode(encoded).map_err(|_| ShortIdError::Malformed)?;
        let (block, given_tag) = raw.split_at(BLOCK_LEN);

        tag(key, block)
            .verify_truncated_left(given_tag)
            .map_err(|_| ShortIdError::Mismatch)?;

        let mut be = [0u8; BLOCK_LEN];
        be.copy_from_slice(block);
        let block = u64::from_be_bytes(be);

        let (mut left, mut right) = ((block >> 32) as u32, block as u32);
        for round in (0..ROUNDS).rev() {
            let prev = right ^ round_fn(key, round, left);
            right = left;
            left = prev;
        }
        Ok((u64::from(left) << 32) | u64::from(right))
    }

    fn key(&self, namespace: &str) -> Result<&HmacSha256, ShortIdError> {
        self.keys
            .get(namespace)
            .ok_or_else(|| ShortIdError::UnknownNamespace(namespace.to_string()))
    }
}

fn keyed(key: &[u8]) -> Result<HmacSha256, ShortIdError> {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(key).map_err(|_| ShortIdError::EmptySalt)
}

fn round_fn(key: &HmacSha256, round: u8, half: u32) -> u32 {
    let mut mac = key.clone();
    mac.update(&[round]);
    mac.update(&half.to_be_bytes());
    let out = mac.finalize().into_bytes();
    u32::from_be_bytes([out[0], out[1], out[2], out[3]])
}

fn tag(key: &HmacSha256, block: &[u8]) -> HmacSha256 {
    let mut mac = key.clone();
    mac.update(b"tag");
    mac.update(block);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ShortIdCodec {
        ShortIdCodec::new(b"deployment-salt", ["run", "user"]).unwrap()
    }

    #[test]
    fn test_roundtrip_edges() {
        let c = codec();
        for id in [0u64, 1, 42, 65_535, u32::MAX as u64, u32::MAX as u64 + 1, u64::MAX] {
            for ns in ["run", "user"] {
                let s = c.encode(ns, id).unwrap();
                assert_eq!(s.len(), ENCODED_LEN);
                assert!(!s.contains('-'));
                assert_eq!(c.decode(ns, &s).unwrap(), id, "ns={ns} id={id}");
            }
        }
    }

    #[test]
    fn test_wrong_namespace_fails() {
        let c = codec();
        let s = c.encode("run", 42).unwrap();
        assert_eq!(c.decode("user", &s), Err(ShortIdError::Mismatch));
        assert_ne!(s, c.encode("user", 42).unwrap());
    }

    #[test]
    fn test_consecutive_ids_do_not_look_sequential() {
        let c = codec();
        let a = c.encode("run", 1000).unwrap();
        let b = c.encode("run", 1001).unwrap();
        let shared = a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count();
        assert!(shared < 8, "{a} vs {b}");
    }

    #[test]
    fn test_salt_changes_output() {
        let other = ShortIdCodec::new(b"another-salt", ["run"]).unwrap();
        let s = codec().encode("run", 7).unwrap();
        assert_ne!(s, other.encode("run", 7).unwrap());
        assert!(other.decode("run", &s).is_err());
    }

    #[test]
    fn test_malformed_inputs() {
        let c = codec();
        assert_eq!(c.decode("run", ""), Err(ShortIdError::Malformed));
        assert_eq!(c.decode("run", "zzz"), Err(ShortIdError::Malformed));
        assert_eq!(
            c.decode("run", &"z".repeat(ENCODED_LEN)),
            Err(ShortIdError::Malformed)
        );
        assert_eq!(
            c.decode("run", &"0".repeat(ENCODED_LEN)),
            Err(ShortIdError::Mismatch)
        );
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let c = codec();
        let mut s = c.encode("run", 99).unwrap().into_bytes();
        let last = s.len() - 1;
        s[last] = if s[last] == b'0' { b'1' } else { b'0' };
        let s = String::from_utf8(s).unwrap();
        assert_eq!(c.decode("run", &s), Err(ShortIdError::Mismatch));
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let c = codec();
        let s = c.encode("run", 123).unwrap().to_ascii_uppercase();
        assert_eq!(c.decode("run", &s).unwrap(), 123);
    }

    #[test]
    fn test_unknown_namespace_and_empty_salt() {
        let c = codec();
        assert_eq!(
            c.encode("project", 1),
            Err(ShortIdError::UnknownNamespace("project".into()))
        );
        assert!(matches!(
            ShortIdCodec::new(b"", ["run"]),
            Err(ShortIdError::EmptySalt)
        ));
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let dbg = format!("{:?}", codec());
        assert!(dbg.contains("run"));
        assert!(!dbg.contains("deployment-salt"));
    }
}
