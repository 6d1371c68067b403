use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

pub const SECONDS_BINARY_LEN: usize = 8;

/// A unix timestamp truncated to whole seconds.
///
/// Object-store keys use the fixed-width decimal form so lexicographic key
/// order matches time order; cache values use the 8-byte big-endian form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seconds(pub i64);

impl Seconds {
    pub fn now() -> Self {
        Seconds(Utc::now().timestamp())
    }

    /// 20-digit zero-padded decimal, wide enough for any i64.
    pub fn decimal(self) -> String {
        format!("{:020}", self.0)
    }

    pub fn parse_decimal(value: &str) -> Result<Self> {
        value
            .parse::<i64>()
            .map(Seconds)
            .map_err(|e| Error::InvalidData(format!("invalid decimal seconds '{value}': {e}")))
    }

    pub fn parse_rfc3339(value: &str) -> Result<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|e| Error::InvalidData(format!("invalid timestamp '{value}': {e}")))?;
        Ok(Seconds(parsed.timestamp()))
    }

    pub fn to_be_bytes(self) -> [u8; SECONDS_BINARY_LEN] {
        (self.0 as u64).to_be_bytes()
    }

    pub fn from_be_bytes(data: &[u8]) -> Result<Self> {
        let raw: [u8; SECONDS_BINARY_LEN] = data
            .try_into()
            .map_err(|_| Error::InvalidData("seconds: invalid length".into()))?;
        Ok(Seconds(u64::from_be_bytes(raw) as i64))
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Utc.timestamp_opt(self.0, 0).single() {
            Some(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => write!(f, "{}", self.0),
        }
    }
}

impl Serialize for Seconds {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Seconds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Seconds::parse_rfc3339(&raw).map_err(D::Error::custom)
    }
}
