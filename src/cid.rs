//! Content-addressed id computation and validation.
//!
//! Ids are pure functions of an object's canonical fields plus a hash
//! configuration. The configuration may differ per backend, so callers must
//! use the configuration of the *target* backend when pre-computing an id
//! before a write. The generated id string is self-describing: base
//! encoding, version, codec and hash algorithm are all recoverable from the
//! id itself, which is what makes `validate` possible without out-of-band
//! knowledge.

use crate::error::StoreError;
use crate::types::{Cid, Commit, Perspective, TextNode};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Base encoding of the id string. The code byte is the first character of
/// the encoded id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Base {
    Hex,
    Base64,
}

impl Base {
    fn code(self) -> char {
        match self {
            Base::Hex => 'f',
            Base::Base64 => 'm',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'f' => Some(Base::Hex),
            'm' => Some(Base::Base64),
            _ => None,
        }
    }
}

/// Payload codec declared in the id header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Raw,
    Json,
}

impl Codec {
    fn code(self) -> u8 {
        match self {
            Codec::Raw => 0x55,
            Codec::Json => 0x0a,
        }
    }

    fn from_code(b: u8) -> Option<Self> {
        match b {
            0x55 => Some(Codec::Raw),
            0x0a => Some(Codec::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    Blake3,
    Sha2_256,
}

impl HashAlgorithm {
    fn code(self) -> u8 {
        match self {
            HashAlgorithm::Blake3 => 0x1e,
            HashAlgorithm::Sha2_256 => 0x12,
        }
    }

    fn from_code(b: u8) -> Option<Self> {
        match b {
            0x1e => Some(HashAlgorithm::Blake3),
            0x12 => Some(HashAlgorithm::Sha2_256),
            _ => None,
        }
    }

    /// Digest arbitrary bytes with this algorithm. 32-byte output for both.
    pub fn digest(self, bytes: &[u8]) -> [u8; 32] {
        match self {
            HashAlgorithm::Blake3 => *blake3::hash(bytes).as_bytes(),
            HashAlgorithm::Sha2_256 => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                hasher.finalize().into()
            }
        }
    }
}

/// Per-backend id configuration, queried via `cid_config()` on the store
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidConfig {
    pub base: Base,
    pub version: u8,
    pub codec: Codec,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for CidConfig {
    fn default() -> Self {
        CidConfig {
            base: Base::Hex,
            version: 1,
            codec: Codec::Raw,
            hash_algorithm: HashAlgorithm::Blake3,
        }
    }
}

/// Canonical byte serialization for hashable records.
///
/// Fields are written in a fixed declared order, each as
/// `name ":" len_be(u64) value`, after a type discriminator. Two
/// structurally equal objects always produce the same bytes; any single
/// field change produces different bytes.
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    pub fn new(kind: &str) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(kind.as_bytes());
        buf.push(b'\n');
        CanonicalWriter { buf }
    }

    pub fn field(&mut self, name: &str, value: &[u8]) {
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
        self.buf.extend_from_slice(value);
    }

    pub fn str_field(&mut self, name: &str, value: &str) {
        self.field(name, value.as_bytes());
    }

    pub fn i64_field(&mut self, name: &str, value: i64) {
        self.field(name, &value.to_be_bytes());
    }

    pub fn list_field(&mut self, name: &str, values: &[Cid]) {
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(&(values.len() as u64).to_be_bytes());
        for value in values {
            self.str_field("item", value.as_str());
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// A record whose id is derived from its canonical fields. The `id` field
/// itself is never part of the canonical bytes.
pub trait Canonical {
    fn canonical_bytes(&self) -> Vec<u8>;
}

impl Canonical for Perspective {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new("perspective");
        w.str_field("origin", self.origin.as_str());
        w.str_field("creatorId", &self.creator_id);
        w.i64_field("timestamp", self.timestamp);
        w.str_field("context", &self.context);
        w.str_field("name", &self.name);
        w.finish()
    }
}

impl Canonical for Commit {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new("commit");
        w.str_field("creatorId", &self.creator_id);
        w.i64_field("timestamp", self.timestamp);
        w.str_field("message", &self.message);
        w.list_field("parentsIds", &self.parents_ids);
        w.str_field("dataId", self.data_id.as_str());
        w.finish()
    }
}

impl Canonical for TextNode {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new("textnode");
        w.str_field("text", &self.text);
        w.list_field("links", &self.links);
        w.str_field("doc_node_type", self.doc_node_type.as_str());
        w.finish()
    }
}

/// Compute the id of `object` under `config`.
pub fn generate_id<T: Canonical>(object: &T, config: &CidConfig) -> Cid {
    let digest = config.hash_algorithm.digest(&object.canonical_bytes());

    let mut payload = Vec::with_capacity(3 + digest.len());
    payload.push(config.version);
    payload.push(config.codec.code());
    payload.push(config.hash_algorithm.code());
    payload.extend_from_slice(&digest);

    let encoded = match config.base {
        Base::Hex => hex::encode(payload),
        Base::Base64 => URL_SAFE_NO_PAD.encode(payload),
    };

    Cid::new(format!("{}{}", config.base.code(), encoded))
}

/// Recover the configuration an id was generated under.
pub fn decode_config(id: &Cid) -> Result<CidConfig, StoreError> {
    let s = id.as_str();
    let mut chars = s.chars();
    let base = chars
        .next()
        .and_then(Base::from_code)
        .ok_or_else(|| StoreError::MalformedId(s.to_string()))?;

    let payload = match base {
        Base::Hex => hex::decode(&s[1..]).map_err(|_| StoreError::MalformedId(s.to_string()))?,
        Base::Base64 => URL_SAFE_NO_PAD
            .decode(&s[1..])
            .map_err(|_| StoreError::MalformedId(s.to_string()))?,
    };

    if payload.len() < 3 + 32 {
        return Err(StoreError::MalformedId(s.to_string()));
    }

    let codec =
        Codec::from_code(payload[1]).ok_or_else(|| StoreError::MalformedId(s.to_string()))?;
    let hash_algorithm = HashAlgorithm::from_code(payload[2])
        .ok_or_else(|| StoreError::MalformedId(s.to_string()))?;

    Ok(CidConfig {
        base,
        version: payload[0],
        codec,
        hash_algorithm,
    })
}

/// Re-derive the id of `object` under the configuration embedded in `id`
/// and compare. A mismatch is reported as `false`; it is the caller's job to
/// treat that as a hard error, never to silently correct the id.
pub fn validate<T: Canonical>(id: &Cid, object: &T) -> Result<bool, StoreError> {
    let config = decode_config(id)?;
    Ok(&generate_id(object, &config) == id)
}

/// Hash an existing id string under a backend's hash algorithm, encoded
/// under the backend's base like the ids themselves. Used when a backend
/// keys head updates by perspective-id hash rather than by the raw id
/// (merge requests).
pub fn hash_cid(id: &Cid, config: &CidConfig) -> String {
    let digest = config.hash_algorithm.digest(id.as_str().as_bytes());
    match config.base {
        Base::Hex => hex::encode(digest),
        Base::Base64 => URL_SAFE_NO_PAD.encode(digest),
    }
}
