use std::path::PathBuf;
use std::str::FromStr;

use cassbak_types::{Error, Result};

pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_S3_STORAGE_CLASS: &str = "STANDARD_IA";

/// Object-store provider, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Google,
}

impl Provider {
    /// Tag byte appended to digest-cache keys so the two incompatible
    /// digest-for-upload binary forms never share a cache entry.
    pub fn cache_tag(self) -> u8 {
        match self {
            Provider::Aws => b's',
            Provider::Google => b'g',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Google => "google",
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aws" => Ok(Provider::Aws),
            "google" => Ok(Provider::Google),
            other => Err(Error::Config(format!("cloud provider not supported: {other}"))),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide settings resolved from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: Provider,
    pub bucket: String,
    pub key_prefix: String,
    pub s3_region: Option<String>,
    pub s3_storage_class: String,
    pub cache_file: PathBuf,
    pub part_size: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::Config("bucket must not be empty".into()));
        }
        if self.provider == Provider::Aws
            && self.s3_region.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::Config(
                "--s3-region (or AWS_REGION) is required for the aws provider".into(),
            ));
        }
        if self.part_size == 0 {
            return Err(Error::Config("part size must be non-zero".into()));
        }
        Ok(())
    }
}
