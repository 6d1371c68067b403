use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use cassbak_types::{Error, Result, Seconds};

use crate::digest::ForRestore;

/// Kind of backup a manifest describes. `Invalid` is the unset placeholder
/// and must never reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ManifestType {
    Invalid,
    Snapshot,
    Incomplete,
    Incremental,
}

impl From<ManifestType> for u8 {
    fn from(t: ManifestType) -> u8 {
        match t {
            ManifestType::Invalid => 0,
            ManifestType::Snapshot => 1,
            ManifestType::Incomplete => 2,
            ManifestType::Incremental => 3,
        }
    }
}

impl TryFrom<u8> for ManifestType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ManifestType::Invalid),
            1 => Ok(ManifestType::Snapshot),
            2 => Ok(ManifestType::Incomplete),
            3 => Ok(ManifestType::Incremental),
            other => Err(Error::InvalidManifestType(other)),
        }
    }
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManifestType::Invalid => "invalid",
            ManifestType::Snapshot => "snapshot",
            ManifestType::Incomplete => "incomplete",
            ManifestType::Incremental => "incremental",
        };
        f.write_str(name)
    }
}

/// (time, type): the identity of one manifest under a host prefix.
/// Ordering matches the lexicographic order of the serialized filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManifestKey {
    pub time: Seconds,
    pub manifest_type: ManifestType,
}

impl ManifestKey {
    pub fn file_name(&self) -> String {
        format!("{}.{}.json", self.time.decimal(), u8::from(self.manifest_type))
    }

    pub fn from_file_name(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() != 3 || parts[0].len() != 20 || parts[1].len() != 1 || parts[2] != "json" {
            return Err(Error::InvalidManifestKey);
        }
        let time = Seconds::parse_decimal(parts[0]).map_err(|_| Error::InvalidManifestKey)?;
        let code: u8 = parts[1].parse().map_err(|_| Error::InvalidManifestKey)?;
        let manifest_type = ManifestType::try_from(code).map_err(|_| Error::InvalidManifestKey)?;
        Ok(ManifestKey {
            time,
            manifest_type,
        })
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.time, self.manifest_type)
    }
}

/// Which cluster and host a set of manifests belongs to. Both components
/// must be non-empty before any bucket key can be formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentity {
    pub cluster: String,
    pub hostname: String,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.hostname)
    }
}

/// One backup event: node identity details plus the map from restore path
/// to addressing digest. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub time: Seconds,
    pub manifest_type: ManifestType,
    pub host_id: String,
    pub address: String,
    pub partitioner: String,
    pub tokens: Vec<String>,
    pub data_files: BTreeMap<String, ForRestore>,
}

impl Manifest {
    pub fn key(&self) -> ManifestKey {
        ManifestKey {
            time: self.time,
            manifest_type: self.manifest_type,
        }
    }

    /// Wire form: gzip-compressed JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, self)
            .map_err(|e| Error::InvalidData(format!("manifest encode: {e}")))?;
        encoder
            .finish()
            .map_err(|e| Error::InvalidData(format!("manifest gzip: {e}")))
    }

    /// Decode a manifest body. Tolerates an already-decompressed body (GCS
    /// performs decompressive transcoding on download) by sniffing the gzip
    /// magic bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let json: Vec<u8> = if data.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::InvalidData(format!("manifest gunzip: {e}")))?;
            out
        } else {
            data.to_vec()
        };
        serde_json::from_slice(&json)
            .map_err(|e| Error::InvalidData(format!("manifest decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Blake2bDigest;

    fn test_digest(seed: u8) -> ForRestore {
        ForRestore(Blake2bDigest::from_slice(&[seed; 64]).unwrap())
    }

    fn test_manifest() -> Manifest {
        let mut data_files = BTreeMap::new();
        data_files.insert("ks1/table-abc123/md-1-big-Data.db".to_string(), test_digest(1));
        data_files.insert("ks1/table-abc123/md-1-big-Index.db".to_string(), test_digest(2));
        Manifest {
            time: Seconds(1_572_915_532),
            manifest_type: ManifestType::Incremental,
            host_id: "7a3712b8-6d0f-4ebc-ac27-b8857af59c9e".to_string(),
            address: "10.0.0.17".to_string(),
            partitioner: "org.apache.cassandra.dht.Murmur3Partitioner".to_string(),
            tokens: vec!["-9214364242897720500".to_string(), "1".to_string()],
            data_files,
        }
    }

    #[test]
    fn key_file_name_round_trips() {
        let key = ManifestKey {
            time: Seconds(1_572_915_532),
            manifest_type: ManifestType::Incremental,
        };
        let name = key.file_name();
        assert_eq!(name, "00000000001572915532.3.json");
        assert_eq!(ManifestKey::from_file_name(&name).unwrap(), key);
    }

    #[test]
    fn bad_file_names_are_rejected() {
        for name in [
            "",
            "not-a-manifest",
            "1572915532.3.json",                  // unpadded time
            "00000000001572915532.33.json",       // two-digit type
            "00000000001572915532.9.json",        // unknown type
            "00000000001572915532.3.gz",          // wrong extension
            "00000000001572915532.3.json.backup", // extra part
        ] {
            let err = ManifestKey::from_file_name(name).unwrap_err();
            assert!(
                matches!(err, Error::InvalidManifestKey),
                "{name}: got {err}"
            );
        }
    }

    #[test]
    fn keys_order_by_time_then_type() {
        let a = ManifestKey {
            time: Seconds(100),
            manifest_type: ManifestType::Incremental,
        };
        let b = ManifestKey {
            time: Seconds(200),
            manifest_type: ManifestType::Snapshot,
        };
        let c = ManifestKey {
            time: Seconds(200),
            manifest_type: ManifestType::Incremental,
        };
        assert!(a < b);
        assert!(b < c);
        // Filename ordering agrees with key ordering.
        assert!(a.file_name() < b.file_name());
        assert!(b.file_name() < c.file_name());
    }

    #[test]
    fn distinct_keys_have_distinct_file_names() {
        let keys = [
            (Seconds(1), ManifestType::Snapshot),
            (Seconds(1), ManifestType::Incremental),
            (Seconds(2), ManifestType::Snapshot),
        ];
        let names: std::collections::BTreeSet<String> = keys
            .iter()
            .map(|(time, manifest_type)| {
                ManifestKey {
                    time: *time,
                    manifest_type: *manifest_type,
                }
                .file_name()
            })
            .collect();
        assert_eq!(names.len(), keys.len());
    }

    #[test]
    fn manifest_type_wire_codes() {
        assert_eq!(u8::from(ManifestType::Incremental), 3);
        assert_eq!(ManifestType::try_from(1).unwrap(), ManifestType::Snapshot);
        assert!(matches!(
            ManifestType::try_from(7),
            Err(Error::InvalidManifestType(7))
        ));
    }

    #[test]
    fn manifest_encodes_as_gzip_json() {
        let manifest = test_manifest();
        let encoded = manifest.encode().unwrap();
        assert_eq!(&encoded[..2], &[0x1f, 0x8b], "not gzip");

        let decoded = Manifest::decode(&encoded).unwrap();
        assert_eq!(decoded.time, manifest.time);
        assert_eq!(decoded.manifest_type, ManifestType::Incremental);
        assert_eq!(decoded.data_files, manifest.data_files);

        // The JSON inside carries the numeric type tag.
        let mut decoder = GzDecoder::new(&encoded[..]);
        let mut json = String::new();
        decoder.read_to_string(&mut json).unwrap();
        assert!(json.contains("\"manifest_type\":3"), "json: {json}");
    }

    #[test]
    fn decode_accepts_bare_json() {
        let manifest = test_manifest();
        let json = serde_json::to_vec(&manifest).unwrap();
        let decoded = Manifest::decode(&json).unwrap();
        assert_eq!(decoded.data_files, manifest.data_files);
    }
}
