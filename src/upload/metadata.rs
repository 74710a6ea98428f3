//! Upload-Metadata and Upload-Checksum header codec
//!
//! `Upload-Metadata` is a comma-separated list of `key base64(value)` pairs.
//! Decoding is permissive: a value that is not valid base64 is kept as an
//! undecodable sentinel instead of failing the request. `Upload-Checksum`
//! (`algorithm base64(digest)`) is strict.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::checksum::{Checksum, ChecksumAlgorithm};
use crate::error::{Result, TusError};

/// A single metadata value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataValue {
    /// Successfully decoded bytes (empty when the pair had no value)
    Bytes(Vec<u8>),
    /// Raw header text that failed base64 decoding
    Undecodable(String),
}

impl MetadataValue {
    /// Decoded bytes, if decoding succeeded
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Undecodable(_) => None,
        }
    }
}

/// Ordered upload metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    /// Insert a value, replacing an existing key in place
    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Decoded value as UTF-8 text
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(MetadataValue::as_bytes)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize back to the `Upload-Metadata` wire format
    pub fn to_header(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| match value {
                MetadataValue::Bytes(bytes) if bytes.is_empty() => key.clone(),
                MetadataValue::Bytes(bytes) => format!("{} {}", key, STANDARD.encode(bytes)),
                MetadataValue::Undecodable(raw) => format!("{} {}", key, raw),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse an `Upload-Metadata` header value
pub fn parse_metadata(header: &str) -> Metadata {
    let mut metadata = Metadata::default();

    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let (key, encoded) = match pair.split_once(' ') {
            Some((key, encoded)) => (key, encoded.trim()),
            None => (pair, ""),
        };

        let value = if encoded.is_empty() {
            MetadataValue::Bytes(Vec::new())
        } else {
            match STANDARD.decode(encoded) {
                Ok(bytes) => MetadataValue::Bytes(bytes),
                Err(_) => MetadataValue::Undecodable(encoded.to_string()),
            }
        };

        metadata.insert(key, value);
    }

    metadata
}

/// Parse an `Upload-Checksum` header value
pub fn parse_checksum_header(header: &str) -> Result<Checksum> {
    let header = header.trim();
    let (name, encoded) = header
        .split_once(' ')
        .ok_or_else(|| TusError::InvalidChecksumHeader(format!("missing digest in '{}'", header)))?;

    let algorithm = ChecksumAlgorithm::parse(name).ok_or_else(|| {
        TusError::InvalidChecksumHeader(format!("unsupported algorithm '{}'", name))
    })?;

    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(TusError::InvalidChecksumHeader("empty digest".to_string()));
    }

    let digest = STANDARD
        .decode(encoded)
        .map_err(|e| TusError::InvalidChecksumHeader(format!("digest is not base64: {}", e)))?;

    Ok(Checksum { algorithm, digest })
}
