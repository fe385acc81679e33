//! Payload codecs and typed stream bindings
//!
//! Every stream carries a single payload type. A [`Topic<T>`] binds a stream
//! name to the [`Codec<T>`] used to read and write it, so handlers, emitters
//! and views are typed at configuration time and never inspect payload types
//! at runtime.
//!
//! Provided codecs:
//!
//! - [`JsonCodec`]: serde_json, for structured payloads
//! - [`BincodeCodec`]: bincode, deterministic, used for snapshots
//! - [`StringCodec`]: raw UTF-8
//! - [`BoolCodec`]: a single `1`/`0` byte

use serde::{de::DeserializeOwned, Serialize};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{content_type} encode failed: {reason}")]
    Encode {
        content_type: &'static str,
        reason: String,
    },

    #[error("{content_type} decode failed: {reason}")]
    Decode {
        content_type: &'static str,
        reason: String,
    },

    #[error("stream '{stream}' carries {registered}, not {requested}")]
    TypeMismatch {
        stream: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("unknown stream '{0}'")]
    UnknownStream(String),

    #[error("stream '{0}' is already registered")]
    DuplicateStream(String),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Byte-level encode/decode contract of a stream's payload type
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> CodecResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> CodecResult<T>;

    /// Short media-type style label used in logs and errors
    fn content_type(&self) -> &'static str;
}

/// JSON codec for any serde type
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            content_type: self.content_type(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            content_type: self.content_type(),
            reason: e.to_string(),
        })
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Bincode codec, deterministic for a given value
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> CodecResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CodecError::Encode {
            content_type: self.content_type(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<T> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode {
            content_type: self.content_type(),
            reason: e.to_string(),
        })
    }

    fn content_type(&self) -> &'static str {
        "application/x-bincode"
    }
}

/// Plain UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> CodecResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Decode {
            content_type: self.content_type(),
            reason: e.to_string(),
        })
    }

    fn content_type(&self) -> &'static str {
        "text/plain"
    }
}

/// Boolean flag encoded as a single `1` or `0` byte
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl Codec<bool> for BoolCodec {
    fn encode(&self, value: &bool) -> CodecResult<Vec<u8>> {
        Ok(vec![u8::from(*value)])
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<bool> {
        match bytes {
            [1] => Ok(true),
            [0] => Ok(false),
            other => Err(CodecError::Decode {
                content_type: self.content_type(),
                reason: format!("expected a single 0/1 byte, got {} bytes", other.len()),
            }),
        }
    }

    fn content_type(&self) -> &'static str {
        "application/x-bool"
    }
}

/// A stream name statically bound to its payload codec
pub struct Topic<T> {
    name: Arc<str>,
    codec: Arc<dyn Codec<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<T: 'static> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("content_type", &self.codec.content_type())
            .finish()
    }
}

impl<T: 'static> Topic<T> {
    pub fn new(name: impl Into<String>, codec: impl Codec<T>) -> Self {
        Self::with_codec(name, Arc::new(codec))
    }

    pub fn with_codec(name: impl Into<String>, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            name: Arc::from(name.into()),
            codec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &Arc<dyn Codec<T>> {
        &self.codec
    }

    pub fn encode(&self, value: &T) -> CodecResult<Vec<u8>> {
        self.codec.encode(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> CodecResult<T> {
        self.codec.decode(bytes)
    }
}

struct Registration {
    type_name: &'static str,
    topic: Box<dyn Any + Send + Sync>,
}

/// Named registry of typed stream codecs.
///
/// Lookups are type-checked: asking for a stream with a different payload
/// type than it was registered with fails with [`CodecError::TypeMismatch`].
#[derive(Default)]
pub struct CodecRegistry {
    streams: HashMap<String, Registration>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` as carrying `T` encoded with `codec`
    pub fn register<T: 'static>(
        &mut self,
        name: impl Into<String>,
        codec: impl Codec<T>,
    ) -> CodecResult<Topic<T>> {
        let name = name.into();
        if self.streams.contains_key(&name) {
            return Err(CodecError::DuplicateStream(name));
        }

        let topic = Topic::new(name.clone(), codec);
        self.streams.insert(
            name,
            Registration {
                type_name: type_name::<T>(),
                topic: Box::new(topic.clone()),
            },
        );
        Ok(topic)
    }

    /// Typed handle of a registered stream
    pub fn topic<T: 'static>(&self, name: &str) -> CodecResult<Topic<T>> {
        let registration = self
            .streams
            .get(name)
            .ok_or_else(|| CodecError::UnknownStream(name.to_string()))?;

        registration
            .topic
            .downcast_ref::<Topic<T>>()
            .cloned()
            .ok_or_else(|| CodecError::TypeMismatch {
                stream: name.to_string(),
                registered: registration.type_name,
                requested: type_name::<T>(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    /// Registered stream names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.keys().cloned().collect();
        names.sort();
        names
    }
}
