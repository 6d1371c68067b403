use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use cassbak_types::{Error, Result};

pub const CACHE_KEY_LEN: usize = 8;
pub const CACHE_VALUE_HEADER_LEN: usize = 24;

/// Identity fingerprint of a file at discovery time: device+inode, size,
/// and modification time. Equality of all components is the sole test for
/// "is this still the file I saw before".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

impl Fingerprint {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Fingerprint {
            device: meta.dev(),
            inode: meta.ino(),
            size: meta.len(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "dev={} ino={} size={} mtime={}.{:09}",
            self.device, self.inode, self.size, self.mtime_sec, self.mtime_nsec
        )
    }
}

/// A file path pinned to the fingerprint captured when it was discovered.
///
/// Every subsequent open, read, and delete re-verifies the fingerprint so a
/// file replaced between discovery and use is detected instead of silently
/// hashed or uploaded.
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
    fingerprint: Fingerprint,
}

impl File {
    pub fn from_metadata(path: PathBuf, meta: &fs::Metadata) -> Self {
        File {
            path,
            fingerprint: Fingerprint::from_metadata(meta),
        }
    }

    pub fn new(path: PathBuf) -> std::io::Result<Self> {
        let meta = fs::metadata(&path)?;
        Ok(Self::from_metadata(path, &meta))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.fingerprint.size
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprint.size == 0
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn verify(&self, current: Fingerprint) -> Result<()> {
        if self.fingerprint != current {
            return Err(Error::FingerprintMismatch {
                path: self.path.display().to_string(),
                expected: self.fingerprint.describe(),
                actual: current.describe(),
            });
        }
        Ok(())
    }

    /// Re-stat the path and verify it still matches.
    pub fn check(&self) -> Result<()> {
        let meta = fs::metadata(&self.path)?;
        self.verify(Fingerprint::from_metadata(&meta))
    }

    /// Verify an already-open handle, typically after reading through it.
    pub fn check_file(&self, file: &fs::File) -> Result<()> {
        let meta = file.metadata()?;
        self.verify(Fingerprint::from_metadata(&meta))
    }

    /// Open for reading; the handle is verified against the recorded
    /// fingerprint before it is returned.
    pub fn open(&self) -> Result<fs::File> {
        let file = fs::File::open(&self.path)?;
        self.check_file(&file)?;
        Ok(file)
    }

    /// Remove the file only if it still matches. A missing file is not an
    /// error; a mismatched one is.
    pub fn delete(&self) -> Result<()> {
        match self.check() {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Digest-cache key: the inode number, big-endian.
    pub fn cache_key(&self) -> [u8; CACHE_KEY_LEN] {
        self.fingerprint.inode.to_be_bytes()
    }

    fn cache_value_header(&self) -> [u8; CACHE_VALUE_HEADER_LEN] {
        let mut header = [0u8; CACHE_VALUE_HEADER_LEN];
        header[0..8].copy_from_slice(&(self.fingerprint.mtime_sec as u64).to_be_bytes());
        header[8..16].copy_from_slice(&(self.fingerprint.mtime_nsec as u64).to_be_bytes());
        header[16..24].copy_from_slice(&self.fingerprint.size.to_be_bytes());
        header
    }

    /// Strip and validate the mtime+size header from a cached value.
    /// Returns `None` when the header does not match the live fingerprint,
    /// in which case the entry must not be used or promoted.
    pub fn unwrap_cache_entry<'a>(&self, value: &'a [u8]) -> Option<&'a [u8]> {
        if value.len() < CACHE_VALUE_HEADER_LEN {
            return None;
        }
        if value[..CACHE_VALUE_HEADER_LEN] != self.cache_value_header() {
            return None;
        }
        Some(&value[CACHE_VALUE_HEADER_LEN..])
    }

    pub fn wrap_cache_entry(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(CACHE_VALUE_HEADER_LEN + data.len());
        out.extend_from_slice(&self.cache_value_header());
        out.extend_from_slice(data);
        out
    }
}
