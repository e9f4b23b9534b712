use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ReproError;

/// Lifecycle of an experiment build.
///
/// `NoBuild -> Queued -> Building -> Built | Error`. `Built` and `Error` are
/// terminal; nothing in this crate moves an experiment out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    #[serde(rename = "NOBUILD")]
    NoBuild,
    Queued,
    Building,
    Built,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NoBuild => "NOBUILD",
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Built => "BUILT",
            BuildStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Built | BuildStatus::Error)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOBUILD" => Ok(BuildStatus::NoBuild),
            "QUEUED" => Ok(BuildStatus::Queued),
            "BUILDING" => Ok(BuildStatus::Building),
            "BUILT" => Ok(BuildStatus::Built),
            "ERROR" => Ok(BuildStatus::Error),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}

/// Lowercase hex SHA-256 of a package's bytes. Primary key of an experiment
/// and the body of a build-queue message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub const HEX_LEN: usize = 64;

    pub fn parse(s: &str) -> Result<Self, ReproError> {
        let s = s.trim();
        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ReproError::not_found(format!("content hash {s:?}")));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub(crate) fn from_digest(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentHash::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

/// Key/value output of the build step (run command lines, input/output paths...).
pub type BuildParameters = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experiment {
    pub hash: ContentHash,
    pub status: BuildStatus,
    pub parameters: BuildParameters,
    pub log_len: u64,
    pub created_at: String,
    pub last_access: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Upload {
    pub id: i64,
    pub experiment_hash: ContentHash,
    pub filename: String,
    pub submitted_ip: String,
    pub submitted_at: String,
    /// `<provider>/<id>` when the package was fetched from a hosting provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_key: Option<String>,
}

/// Bytes of a build log starting at `offset`. Poll again from `next_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogChunk {
    #[serde(with = "lossy_utf8")]
    pub data: Vec<u8>,
    pub offset: u64,
    pub next_offset: u64,
}

impl LogChunk {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

mod lossy_utf8 {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(data))
    }
}

/// Permanent public reference to an upload: `base64url(hash "|" filename)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentCode {
    pub hash: ContentHash,
    pub filename: String,
}

impl ExperimentCode {
    pub fn new(hash: ContentHash, filename: impl Into<String>) -> Self {
        Self {
            hash,
            filename: filename.into(),
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}|{}", self.hash, self.filename))
    }

    pub fn decode(code: &str) -> Result<Self, ReproError> {
        let not_found = || ReproError::not_found("experiment code");
        let raw = URL_SAFE_NO_PAD
            .decode(code.trim_end_matches('='))
            .map_err(|_| not_found())?;
        let raw = String::from_utf8(raw).map_err(|_| not_found())?;
        let (hash, filename) = raw.split_once('|').ok_or_else(not_found)?;
        let hash = ContentHash::parse(hash).map_err(|_| not_found())?;
        Ok(Self {
            hash,
            filename: filename.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_status_strings() {
        for s in [
            BuildStatus::NoBuild,
            BuildStatus::Queued,
            BuildStatus::Building,
            BuildStatus::Built,
            BuildStatus::Error,
        ] {
            assert_eq!(s.as_str().parse::<BuildStatus>().unwrap(), s);
            assert_eq!(
                serde_json::to_string(&s).unwrap(),
                format!("\"{}\"", s.as_str())
            );
        }
        assert!("DONE".parse::<BuildStatus>().is_err());
        assert!(BuildStatus::Built.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
    }

    #[test]
    fn test_content_hash_validation() {
        assert_eq!(ContentHash::parse(H).unwrap().as_str(), H);
        assert_eq!(
            ContentHash::parse(&H.to_ascii_uppercase()).unwrap().as_str(),
            H
        );
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_experiment_code() {
        let code = ExperimentCode::new(ContentHash::parse(H).unwrap(), "bash-count.rpz");
        let encoded = code.encode();
        assert!(!encoded.contains('/') && !encoded.contains('+'));
        assert_eq!(ExperimentCode::decode(&encoded).unwrap(), code);

        assert!(ExperimentCode::decode("not base64!").is_err());
        assert!(ExperimentCode::decode(&URL_SAFE_NO_PAD.encode("nohash")).is_err());
        assert!(ExperimentCode::decode(&URL_SAFE_NO_PAD.encode("abc|file.rpz")).is_err());
    }

    #[test]
    fn test_log_chunk_serializes_as_text() {
        let chunk = LogChunk {
            data: b"step 1\n".to_vec(),
            offset: 0,
            next_offset: 7,
        };
        let v = serde_json::to_value(&chunk).unwrap();
        assert_eq!(v["data"], "step 1\n");
        assert_eq!(v["next_offset"], 7);
    }
}
