//! Content-type codecs.
//!
//! # Data Flow
//! ```text
//! x-content-type ──▶ CodecRegistry::lookup ──▶ Codec::{Json, MsgPack}
//!                                                  │
//!                        typed value ◀── decode ───┴── encode ──▶ bytes
//! ```
//!
//! The transport itself never looks inside payloads: `RawCodec` moves
//! opaque bytes through tonic, and the selected `Codec` runs at the edges
//! (client invoke, server dispatch, gateway transcoding).

mod raw;

pub use raw::RawCodec;

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const APPLICATION_JSON: &str = "application/json";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MULTIPART_FORM: &str = "multipart/form-data";
pub const APPLICATION_PROTO: &str = "application/proto";
pub const APPLICATION_PROTOBUF: &str = "application/protobuf";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const APPLICATION_GRPC: &str = "application/grpc";
pub const APPLICATION_GRPC_PROTO: &str = "application/grpc+proto";

/// Content type assumed when a call carries none.
pub const DEFAULT_CONTENT_TYPE: &str = APPLICATION_GRPC;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Marshal strategy selected by content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// JSON; raw JSON bytes pass through untouched.
    Json,
    /// Structured binary (MessagePack with named fields).
    MsgPack,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MsgPack => "msgpack",
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Codec::Json)
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        let buf = match self {
            Codec::Json => serde_json::to_vec(value)?,
            Codec::MsgPack => rmp_serde::to_vec_named(value)?,
        };
        Ok(Bytes::from(buf))
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::MsgPack => Ok(rmp_serde::from_slice(data)?),
        }
    }

    /// Decode over the zero value: fields missing from the payload keep
    /// their defaults, and an empty payload is the zero value itself.
    pub fn decode_or_default<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        let incoming: serde_json::Value = match self {
            Codec::Json => serde_json::from_slice(data)?,
            Codec::MsgPack => rmp_serde::from_slice(data)?,
        };
        let mut base = serde_json::to_value(T::default())?;
        merge_into(&mut base, incoming);
        Ok(serde_json::from_value(base)?)
    }

    /// Re-express an encoded payload as JSON bytes.
    pub fn to_json(&self, data: Bytes) -> Result<Bytes, CodecError> {
        match self {
            Codec::Json => Ok(data),
            Codec::MsgPack => {
                if data.is_empty() {
                    return Ok(Bytes::from_static(b"{}"));
                }
                let value: serde_json::Value = rmp_serde::from_slice(&data)?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            }
        }
    }
}

/// Overlay `patch` on `base`. Objects merge key by key; anything else
/// replaces the base value.
fn merge_into(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Strip parameters (`; charset=...`) and normalize case.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Content type → codec map.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Codec>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self { codecs: HashMap::new() }
    }

    pub fn register(&mut self, content_type: &str, codec: Codec) {
        self.codecs.insert(normalize_content_type(content_type), codec);
    }

    /// Find the codec for a content type. Unknown types yield `None`.
    pub fn lookup(&self, content_type: &str) -> Option<Codec> {
        self.codecs.get(&normalize_content_type(content_type)).copied()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for ct in [APPLICATION_JSON, FORM_URLENCODED, MULTIPART_FORM] {
            registry.register(ct, Codec::Json);
        }
        for ct in [
            APPLICATION_PROTO,
            APPLICATION_PROTOBUF,
            OCTET_STREAM,
            APPLICATION_GRPC,
            APPLICATION_GRPC_PROTO,
        ] {
            registry.register(ct, Codec::MsgPack);
        }
        registry
    }
}
