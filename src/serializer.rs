//! Encoding of managed values to bytes
//!
//! A [`FileManager`](crate::FileManager) is generic over the value it persists
//! and delegates the byte format to a [`Serializer`]. Three formats ship with
//! the crate:
//!
//! - [`JsonSerializer`] - serde_json, compact or pretty printed
//! - [`BincodeSerializer`] - bincode in serde mode, for compact binary files
//! - [`TextSerializer`] - plain UTF-8 text for `String` values
//!
//! Decoding failures are reported as [`SafekeepError::Decode`], which is what
//! the rollback engine treats as a corrupt backup.

use crate::error::{Result, SafekeepError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Encode/decode capability for one value type
pub trait Serializer<T>: Send + Sync {
    /// Encode a value into the bytes written to disk
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes read from disk
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding through serde_json
#[derive(Debug)]
pub struct JsonSerializer<T> {
    pretty: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    /// Compact JSON
    pub fn new() -> Self {
        Self {
            pretty: false,
            _marker: PhantomData,
        }
    }

    /// Indented JSON, friendlier for files people also edit by hand
    pub fn pretty() -> Self {
        Self {
            pretty: true,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        encoded.map_err(|e| SafekeepError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Binary encoding through bincode's serde integration
#[derive(Debug)]
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    /// Bincode with the standard configuration
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        if read != bytes.len() {
            return Err(SafekeepError::decode(format!(
                "{} trailing bytes after value",
                bytes.len() - read
            )));
        }
        Ok(value)
    }
}

/// Plain UTF-8 text
#[derive(Debug, Default, Clone, Copy)]
pub struct TextSerializer;

impl Serializer<String> for TextSerializer {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| SafekeepError::decode(e.to_string()))
    }
}
