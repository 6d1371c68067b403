use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

use cassbak_types::{Error, Result, Seconds};

use crate::digest::ForRestore;
use crate::manifests::{ManifestKey, NodeIdentity};

const BLOB_PREFIX: &str = "files/blake2b/";
const MANIFESTS_PREFIX: &str = "manifests/";

/// Pure key-schema functions: digests and node identities in, bucket object
/// keys out, and the inverses. No I/O lives here.
#[derive(Debug, Clone)]
pub struct KeyStore {
    pub bucket: String,
    prefix: String,
}

impl KeyStore {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        KeyStore {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key_with_prefix(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Blob key, sharded by the first two encoded characters so keys spread
    /// across the bucket's partition space.
    pub fn blob_key(&self, digests: &ForRestore) -> String {
        let encoded = digests.url_safe();
        self.key_with_prefix(&format!(
            "{BLOB_PREFIX}{}/{}/{}",
            &encoded[0..1],
            &encoded[1..2],
            &encoded[2..]
        ))
    }

    pub fn decode_blob_key(&self, key: &str) -> Result<ForRestore> {
        let blob_prefix = self.key_with_prefix(BLOB_PREFIX);
        let encoded = key
            .strip_prefix(&blob_prefix)
            .ok_or_else(|| Error::InvalidData(format!("not a blob key: {key}")))?;
        // Reassemble "c0/c1/rest" into the original encoding.
        if encoded.len() < 5 || encoded.as_bytes()[1] != b'/' || encoded.as_bytes()[3] != b'/' {
            return Err(Error::InvalidData(format!("malformed blob key: {key}")));
        }
        let mut joined = String::with_capacity(encoded.len() - 2);
        joined.push_str(&encoded[0..1]);
        joined.push_str(&encoded[2..3]);
        joined.push_str(&encoded[4..]);
        let raw = URL_SAFE
            .decode(&joined)
            .map_err(|e| Error::InvalidData(format!("blob key base64: {e}")))?;
        ForRestore::unmarshal(&raw)
    }

    pub fn clusters_prefix(&self) -> String {
        self.key_with_prefix(MANIFESTS_PREFIX)
    }

    pub fn cluster_hosts_prefix(&self, cluster: &str) -> Result<String> {
        if cluster.is_empty() {
            return Err(Error::Config("empty cluster name".into()));
        }
        Ok(format!(
            "{}{}/",
            self.clusters_prefix(),
            URL_SAFE.encode(cluster)
        ))
    }

    pub fn decode_cluster(&self, key: &str) -> Result<String> {
        let trimmed = key
            .strip_prefix(&self.clusters_prefix())
            .ok_or_else(|| Error::InvalidData(format!("not a cluster key: {key}")))?
            .trim_end_matches('/');
        let raw = URL_SAFE
            .decode(trimmed)
            .map_err(|e| Error::InvalidData(format!("cluster key base64: {e}")))?;
        String::from_utf8(raw).map_err(|e| Error::InvalidData(format!("cluster key utf8: {e}")))
    }

    pub fn manifests_prefix(&self, identity: &NodeIdentity) -> Result<String> {
        if identity.hostname.is_empty() {
            return Err(Error::Config("empty hostname".into()));
        }
        Ok(format!(
            "{}{}/",
            self.cluster_hosts_prefix(&identity.cluster)?,
            URL_SAFE.encode(&identity.hostname)
        ))
    }

    pub fn manifest_key(&self, identity: &NodeIdentity, key: &ManifestKey) -> Result<String> {
        Ok(format!("{}{}", self.manifests_prefix(identity)?, key.file_name()))
    }

    /// Listing boundary: a host prefix followed by a bare fixed-width time,
    /// used as `start-after` or as the upper bound during listing.
    pub fn manifest_time_range_key(
        &self,
        identity: &NodeIdentity,
        boundary: Seconds,
    ) -> Result<String> {
        Ok(format!("{}{}", self.manifests_prefix(identity)?, boundary.decimal()))
    }

    pub fn node_identity_from_key(&self, key: &str) -> Result<NodeIdentity> {
        let trimmed = key
            .strip_prefix(&self.clusters_prefix())
            .ok_or_else(|| Error::InvalidData(format!("not a manifests key: {key}")))?
            .trim_end_matches('/');
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() != 2 {
            return Err(Error::InvalidData(format!(
                "invalid number of parts in key: {key}"
            )));
        }
        let cluster = URL_SAFE
            .decode(parts[0])
            .map_err(|e| Error::InvalidData(format!("cluster base64: {e}")))?;
        let hostname = URL_SAFE
            .decode(parts[1])
            .map_err(|e| Error::InvalidData(format!("hostname base64: {e}")))?;
        Ok(NodeIdentity {
            cluster: String::from_utf8(cluster)
                .map_err(|e| Error::InvalidData(format!("cluster utf8: {e}")))?,
            hostname: String::from_utf8(hostname)
                .map_err(|e| Error::InvalidData(format!("hostname utf8: {e}")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Blake2bDigest;
    use crate::manifests::ManifestType;

    fn digest(seed: u8) -> ForRestore {
        ForRestore(Blake2bDigest::from_slice(&[seed; 64]).unwrap())
    }

    fn identity() -> NodeIdentity {
        NodeIdentity {
            cluster: "prod/cluster one".to_string(),
            hostname: "cass-17.example.com".to_string(),
        }
    }

    #[test]
    fn blob_key_is_sharded_and_round_trips() {
        let ks = KeyStore::new("bkt", "");
        let d = digest(0x5a);
        let key = ks.blob_key(&d);
        assert!(key.starts_with("files/blake2b/"));
        let rest = key.strip_prefix("files/blake2b/").unwrap();
        assert_eq!(rest.as_bytes()[1], b'/');
        assert_eq!(rest.as_bytes()[3], b'/');
        assert_eq!(ks.decode_blob_key(&key).unwrap(), d);
    }

    #[test]
    fn blob_keys_are_injective() {
        let ks = KeyStore::new("bkt", "prefix");
        assert_ne!(ks.blob_key(&digest(1)), ks.blob_key(&digest(2)));
        assert_eq!(ks.blob_key(&digest(1)), ks.blob_key(&digest(1)));
    }

    #[test]
    fn prefix_is_normalized() {
        let with_slash = KeyStore::new("bkt", "/");
        let empty = KeyStore::new("bkt", "");
        assert_eq!(with_slash.blob_key(&digest(1)), empty.blob_key(&digest(1)));

        let nested = KeyStore::new("bkt", "backups/site-a/");
        assert!(nested
            .blob_key(&digest(1))
            .starts_with("backups/site-a/files/blake2b/"));
    }

    #[test]
    fn encoded_identities_contain_no_slash() {
        let ks = KeyStore::new("bkt", "");
        let prefix = ks.manifests_prefix(&identity()).unwrap();
        let tail = prefix.strip_prefix("manifests/").unwrap();
        // cluster-b64 "/" hostname-b64 "/" — exactly two separators.
        assert_eq!(tail.matches('/').count(), 2);
    }

    #[test]
    fn manifest_key_round_trips_through_identity_decode() {
        let ks = KeyStore::new("bkt", "p");
        let id = identity();
        let prefix = ks.cluster_hosts_prefix(&id.cluster).unwrap();
        assert_eq!(ks.decode_cluster(&prefix).unwrap(), id.cluster);

        let host_prefix = ks.manifests_prefix(&id).unwrap();
        assert_eq!(ks.node_identity_from_key(&host_prefix).unwrap(), id);
    }

    #[test]
    fn distinct_identities_produce_distinct_manifest_keys() {
        let ks = KeyStore::new("bkt", "");
        let key = ManifestKey {
            time: Seconds(42),
            manifest_type: ManifestType::Snapshot,
        };
        let a = ks
            .manifest_key(
                &NodeIdentity {
                    cluster: "c1".into(),
                    hostname: "h1".into(),
                },
                &key,
            )
            .unwrap();
        let b = ks
            .manifest_key(
                &NodeIdentity {
                    cluster: "c1".into(),
                    hostname: "h2".into(),
                },
                &key,
            )
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_identity_components_are_rejected() {
        let ks = KeyStore::new("bkt", "");
        assert!(ks.cluster_hosts_prefix("").is_err());
        assert!(ks
            .manifests_prefix(&NodeIdentity {
                cluster: "c".into(),
                hostname: String::new(),
            })
            .is_err());
    }

    #[test]
    fn time_range_key_sorts_between_manifest_names() {
        let ks = KeyStore::new("bkt", "");
        let id = identity();
        let early = ks
            .manifest_key(
                &id,
                &ManifestKey {
                    time: Seconds(100),
                    manifest_type: ManifestType::Snapshot,
                },
            )
            .unwrap();
        let boundary = ks.manifest_time_range_key(&id, Seconds(100)).unwrap();
        let late = ks
            .manifest_key(
                &id,
                &ManifestKey {
                    time: Seconds(101),
                    manifest_type: ManifestType::Snapshot,
                },
            )
            .unwrap();
        // "…100" < "…100.1.json" < "…101…": a bare-time boundary sorts
        // before every manifest of that same second, so start-after at T
        // still returns the manifests at T, and an upper bound at T
        // excludes them.
        assert!(boundary < early);
        assert!(early < late);
    }

    #[test]
    fn malformed_blob_keys_are_rejected() {
        let ks = KeyStore::new("bkt", "");
        assert!(ks.decode_blob_key("files/blake2b/ab").is_err());
        assert!(ks.decode_blob_key("manifests/whatever").is_err());
        assert!(ks.decode_blob_key("files/blake2b/a/b/!!!notbase64").is_err());
    }
}
