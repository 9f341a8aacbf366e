//! Values the cache knows how to store.
//!
//! Stores hold bytes; [`CachePayload`] turns a computed value into bytes and
//! back, and exposes what the post-check needs to see.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::store::{StoreError, StoredEntry};

pub trait CachePayload: Clone + Send + Sync + 'static {
    fn encode(&self) -> Result<Bytes, StoreError>;

    fn decode(bytes: &[u8]) -> Result<Self, StoreError>;

    fn is_success(&self) -> bool {
        true
    }

    /// Per-user content that must never be shared through the cache.
    fn is_private(&self) -> bool {
        false
    }

    /// Text scanned for error signatures, if the payload has any.
    fn text(&self) -> Option<Cow<'_, str>> {
        None
    }

    /// Size checked against the configured bounds. Defaults to the encoded
    /// length.
    fn body_len(&self) -> Option<usize> {
        None
    }

    fn from_entry(entry: &StoredEntry) -> Result<Self, StoreError> {
        Self::decode(&entry.payload)
    }
}

impl CachePayload for Bytes {
    fn encode(&self) -> Result<Bytes, StoreError> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        std::str::from_utf8(self).ok().map(Cow::Borrowed)
    }

    fn from_entry(entry: &StoredEntry) -> Result<Self, StoreError> {
        Ok(entry.payload.clone())
    }
}

impl CachePayload for String {
    fn encode(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        String::from_utf8(bytes.to_vec()).map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self.as_str()))
    }
}

/// Any serde value, stored as JSON. Used for query rows, counts, schemas
/// and permission maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> CachePayload for Json<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Bytes, StoreError> {
        serde_json::to_vec(&self.0)
            .map(Bytes::from)
            .map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|err| StoreError::Serialization(err.to_string()))
    }
}

/// A buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    /// Lower-cased header names in their original order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct ResponseHead<'a> {
    status: u16,
    headers: Vec<(Cow<'a, str>, Cow<'a, str>)>,
}

impl CachedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn from_bytes(bytes: Bytes) -> Result<Self, StoreError> {
        let split = bytes
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or_else(|| StoreError::Serialization("response head terminator missing".into()))?;
        let head: ResponseHead<'_> = serde_json::from_slice(&bytes[..split])
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        Ok(Self {
            status: head.status,
            headers: head
                .headers
                .into_iter()
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect(),
            body: bytes.slice(split + 1..),
        })
    }
}

impl CachePayload for CachedResponse {
    /// Layout: compact JSON head, a newline, then the raw body.
    fn encode(&self) -> Result<Bytes, StoreError> {
        let head = ResponseHead {
            status: self.status,
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (Cow::Borrowed(name.as_str()), Cow::Borrowed(value.as_str())))
                .collect(),
        };
        let head =
            serde_json::to_vec(&head).map_err(|err| StoreError::Serialization(err.to_string()))?;
        let mut out = BytesMut::with_capacity(head.len() + 1 + self.body.len());
        out.put_slice(&head);
        out.put_u8(b'\n');
        out.put_slice(&self.body);
        Ok(out.freeze())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Self::from_bytes(Bytes::copy_from_slice(bytes))
    }

    fn from_entry(entry: &StoredEntry) -> Result<Self, StoreError> {
        Self::from_bytes(entry.payload.clone())
    }

    fn is_success(&self) -> bool {
        self.status == 200
    }

    fn is_private(&self) -> bool {
        if self.header("set-cookie").is_some() {
            return true;
        }
        self.header_values("cache-control").any(|value| {
            value.split(',').map(str::trim).any(|directive| {
                directive.eq_ignore_ascii_case("private")
                    || directive.eq_ignore_ascii_case("no-store")
            })
        })
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        std::str::from_utf8(&self.body).ok().map(Cow::Borrowed)
    }

    fn body_len(&self) -> Option<usize> {
        Some(self.body.len())
    }
}
