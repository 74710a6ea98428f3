//! Integrity verification for completed uploads
//!
//! Streams the stored content of an upload through the digest algorithm the
//! client declared at creation and compares the result.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::digest::DynDigest;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use tokio::io::AsyncReadExt;

use super::sink::ByteSink;
use crate::error::{Result, SinkError, TusError};

/// Read buffer used when digesting stored content
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithms accepted in `Upload-Checksum`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    /// Protocol name of the algorithm
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Look up an algorithm by protocol name (case-insensitive)
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(name))
    }

    fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(Md5::default()),
            Self::Sha1 => Box::new(Sha1::default()),
            Self::Sha224 => Box::new(Sha224::default()),
            Self::Sha256 => Box::new(Sha256::default()),
            Self::Sha384 => Box::new(Sha384::default()),
            Self::Sha512 => Box::new(Sha512::default()),
        }
    }
}

/// Client-declared checksum of a complete upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

/// Compute a digest of in-memory data
pub fn compute_digest(algorithm: ChecksumAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize().into_vec()
}

/// Stream the full stored content through `algorithm`
pub async fn digest(
    sink: &dyn ByteSink,
    storage_path: &str,
    algorithm: ChecksumAlgorithm,
) -> Result<Vec<u8>, SinkError> {
    let mut reader = sink.open(storage_path).await?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; DIGEST_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into_vec())
}

/// Compare a declared checksum against a computed digest
///
/// An empty declared digest requests no verification and always passes.
pub fn verify(declared: &Checksum, computed: &[u8]) -> Result<()> {
    if declared.digest.is_empty() || declared.digest == computed {
        return Ok(());
    }

    Err(TusError::ChecksumMismatch {
        algorithm: declared.algorithm.name(),
        declared: hex::encode(&declared.digest),
        computed: hex::encode(computed),
    })
}
