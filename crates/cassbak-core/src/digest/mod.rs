mod blake2b;
pub mod cache;
pub mod parts;

use std::io::{Read, Seek, SeekFrom};

use blake2::Blake2b512;
use digest::Digest as _;
use md5::Md5;

use cassbak_types::{Error, Result};

use crate::cancel::CancelToken;
use crate::config::Provider;
use crate::paranoid;

pub use blake2b::{Blake2bDigest, BLAKE2B_DIGEST_LEN};
pub use cache::DigestCache;
pub use parts::{PartDigests, PartDigestsMaker};

const READ_BUF_LEN: usize = 32 * 1024;
const CANCEL_CHECK_INTERVAL: u64 = 8 * 1024 * 1024;

const GCS_MARSHAL_LEN: usize = BLAKE2B_DIGEST_LEN + 8 + parts::MD5_LEN;

/// The addressing digest: a blob's identity in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForRestore(pub Blake2bDigest);

impl ForRestore {
    pub fn url_safe(&self) -> String {
        self.0.url_safe()
    }

    pub fn marshal(&self) -> [u8; BLAKE2B_DIGEST_LEN] {
        *self.0.as_bytes()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        Ok(ForRestore(Blake2bDigest::from_slice(data)?))
    }

    /// Re-hash an already-downloaded file and compare against this digest.
    pub fn verify<R: Read + Seek>(&self, cancel: &CancelToken, reader: &mut R) -> Result<()> {
        reader.seek(SeekFrom::Start(0))?;
        let mut hasher = Blake2b512::new();
        let mut buf = vec![0u8; READ_BUF_LEN];
        let mut since_check = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            since_check += n as u64;
            if since_check >= CANCEL_CHECK_INTERVAL {
                cancel.check()?;
                since_check = 0;
            }
        }
        let actual = Blake2bDigest::from_hasher(hasher);
        if actual != self.0 {
            return Err(Error::DigestMismatch {
                expected: self.0.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ForRestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl serde::Serialize for ForRestore {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for ForRestore {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        Ok(ForRestore(Blake2bDigest::deserialize(d)?))
    }
}

/// Everything needed to upload one file, in the form the target provider
/// requires. The two variants marshal incompatibly, so cache keys carry a
/// provider tag and unmarshalling is always provider-directed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForUpload {
    S3 {
        blake2b: Blake2bDigest,
        parts: PartDigests,
    },
    Gcs {
        blake2b: Blake2bDigest,
        md5: [u8; parts::MD5_LEN],
        total_length: u64,
    },
}

impl ForUpload {
    /// Hash an entire file in one buffered pass: BLAKE2b always, plus the
    /// provider-specific digests. The fingerprint is re-verified after the
    /// final read, so a file mutated mid-hash is rejected here.
    pub fn compute(
        cancel: &CancelToken,
        file: &paranoid::File,
        provider: Provider,
        part_size: u64,
    ) -> Result<Self> {
        match provider {
            Provider::Aws => {
                let mut maker = PartDigestsMaker::new(part_size);
                let blake2b = hash_file(cancel, file, |chunk| maker.write(chunk))?;
                Ok(ForUpload::S3 {
                    blake2b,
                    parts: maker.finish(),
                })
            }
            Provider::Google => {
                let mut md5 = Md5::new();
                let mut total_length = 0u64;
                let blake2b = hash_file(cancel, file, |chunk| {
                    md5.update(chunk);
                    total_length += chunk.len() as u64;
                })?;
                Ok(ForUpload::Gcs {
                    blake2b,
                    md5: md5.finalize().into(),
                    total_length,
                })
            }
        }
    }

    pub fn for_restore(&self) -> ForRestore {
        match self {
            ForUpload::S3 { blake2b, .. } | ForUpload::Gcs { blake2b, .. } => ForRestore(*blake2b),
        }
    }

    pub fn total_length(&self) -> u64 {
        match self {
            ForUpload::S3 { parts, .. } => parts.total_length(),
            ForUpload::Gcs { total_length, .. } => *total_length,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        match self {
            ForUpload::S3 { blake2b, parts } => {
                let parts_raw = parts.marshal();
                let mut out = Vec::with_capacity(BLAKE2B_DIGEST_LEN + parts_raw.len());
                out.extend_from_slice(blake2b.as_bytes());
                out.extend_from_slice(&parts_raw);
                out
            }
            ForUpload::Gcs {
                blake2b,
                md5,
                total_length,
            } => {
                let mut out = Vec::with_capacity(GCS_MARSHAL_LEN);
                out.extend_from_slice(blake2b.as_bytes());
                out.extend_from_slice(&total_length.to_be_bytes());
                out.extend_from_slice(md5);
                out
            }
        }
    }

    pub fn unmarshal(provider: Provider, data: &[u8]) -> Result<Self> {
        if data.len() < BLAKE2B_DIGEST_LEN {
            return Err(Error::InvalidData("digest for upload: short data".into()));
        }
        let blake2b = Blake2bDigest::from_slice(&data[..BLAKE2B_DIGEST_LEN])?;
        let rest = &data[BLAKE2B_DIGEST_LEN..];
        match provider {
            Provider::Aws => Ok(ForUpload::S3 {
                blake2b,
                parts: PartDigests::unmarshal(rest)?,
            }),
            Provider::Google => {
                if data.len() != GCS_MARSHAL_LEN {
                    return Err(Error::InvalidData(
                        "digest for upload: bad gcs length".into(),
                    ));
                }
                let total_length = u64::from_be_bytes(rest[..8].try_into().unwrap());
                let md5: [u8; parts::MD5_LEN] = rest[8..].try_into().unwrap();
                Ok(ForUpload::Gcs {
                    blake2b,
                    md5,
                    total_length,
                })
            }
        }
    }
}

/// Single-pass streaming hash of a paranoid file. `on_chunk` sees every
/// buffer exactly once, in order, so provider digests ride along for free.
fn hash_file(
    cancel: &CancelToken,
    file: &paranoid::File,
    mut on_chunk: impl FnMut(&[u8]),
) -> Result<Blake2bDigest> {
    let mut os_file = file.open()?;
    let mut hasher = Blake2b512::new();
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut since_check = 0u64;
    loop {
        let n = os_file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        on_chunk(&buf[..n]);
        since_check += n as u64;
        if since_check >= CANCEL_CHECK_INTERVAL {
            cancel.check()?;
            since_check = 0;
        }
    }
    file.check_file(&os_file)?;
    Ok(Blake2bDigest::from_hasher(hasher))
}
