use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use cassbak_types::{Error, Result, Seconds};

use crate::bucket::BucketClient;
use crate::cancel::CancelToken;
use crate::manifests::{Manifest, ManifestType, NodeIdentity};

pub const CASSANDRA_CONFIG_FILE: &str = "/etc/cassandra/cassandra.yaml";

/// The slice of cassandra.yaml this tool cares about.
#[derive(Debug, Clone)]
pub struct CassandraConfig {
    pub cluster_name: String,
    pub listen_address: String,
    pub partitioner: String,
    pub tokens: Vec<String>,
}

#[derive(Deserialize)]
struct RawCassandraYaml {
    #[serde(default)]
    cluster_name: String,
    #[serde(default)]
    initial_token: String,
    #[serde(default)]
    listen_address: String,
    #[serde(default)]
    partitioner: String,
}

pub fn load_cassandra_config(path: &Path) -> Result<CassandraConfig> {
    let raw = fs::read_to_string(path)?;
    let parsed: RawCassandraYaml = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("cassandra config {}: {e}", path.display())))?;

    let mut tokens: Vec<String> = parsed
        .initial_token
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    tokens.sort();

    Ok(CassandraConfig {
        cluster_name: parsed.cluster_name,
        listen_address: parsed.listen_address,
        partitioner: parsed.partitioner,
        tokens,
    })
}

/// Hostname up to the first dot.
pub fn short_hostname() -> Result<String> {
    let name = hostname::get()
        .map_err(|e| Error::Other(format!("hostname lookup failed: {e}")))?
        .to_string_lossy()
        .to_string();
    Ok(name.split('.').next().unwrap_or(&name).to_string())
}

/// Node identity plus a manifest skeleton for a backup run. Overrides win
/// but a mismatch against what the node reports is worth a warning.
///
/// The live system.local host id is supplied by an external collaborator;
/// offline, the skeleton's host_id stays empty.
pub fn identity_and_template(
    config_path: &Path,
    override_cluster: Option<&str>,
    override_hostname: Option<&str>,
) -> Result<(NodeIdentity, Manifest)> {
    let cfg = load_cassandra_config(config_path)?;

    let cluster = match override_cluster {
        Some(cluster) if !cluster.is_empty() => {
            if cluster != cfg.cluster_name {
                warn!(actual = %cfg.cluster_name, using = %cluster, "cluster name overridden");
            }
            cluster.to_string()
        }
        _ => cfg.cluster_name.clone(),
    };

    let actual_hostname = short_hostname()?;
    let hostname = match override_hostname {
        Some(hostname) if !hostname.is_empty() => {
            if hostname != actual_hostname {
                warn!(actual = %actual_hostname, using = %hostname, "hostname overridden");
            }
            hostname.to_string()
        }
        _ => actual_hostname,
    };

    let identity = NodeIdentity { cluster, hostname };
    let template = Manifest {
        time: Seconds::now(),
        manifest_type: ManifestType::Invalid,
        host_id: String::new(),
        address: cfg.listen_address,
        partitioner: cfg.partitioner,
        tokens: cfg.tokens,
        data_files: BTreeMap::new(),
    };
    Ok((identity, template))
}

/// Resolve which node to restore. With both overrides present nothing is
/// looked up; otherwise the cluster comes from cassandra.yaml and the host
/// is found by prefix-matching the bucket's host listing, which must name
/// exactly one node.
pub fn for_restore(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    config_path: &Path,
    override_cluster: Option<&str>,
    override_hostname: Option<&str>,
    override_pattern: Option<&str>,
) -> Result<NodeIdentity> {
    let mut cluster = override_cluster.unwrap_or("").to_string();
    let hostname = override_hostname.unwrap_or("").to_string();
    if !cluster.is_empty() && !hostname.is_empty() {
        return Ok(NodeIdentity { cluster, hostname });
    }

    if cluster.is_empty() {
        cluster = load_cassandra_config(config_path)?.cluster_name;
    }
    if !hostname.is_empty() {
        return Ok(NodeIdentity { cluster, hostname });
    }

    let prefix = match override_pattern {
        Some(pattern) if !pattern.is_empty() => pattern.to_string(),
        _ => short_hostname()?,
    };
    let matched = matching_cluster_hosts(cancel, client, &cluster, &prefix)?;
    if matched.len() != 1 {
        return Err(Error::Config(format!(
            "hostname pattern '{prefix}' matched {} hosts in cluster '{cluster}'",
            matched.len()
        )));
    }
    info!(identity = %matched[0], "selected host for restore");
    Ok(matched[0].clone())
}

/// All of a cluster's hosts whose hostname starts with `prefix` and has at
/// least one further character.
pub fn matching_cluster_hosts(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    cluster: &str,
    prefix: &str,
) -> Result<Vec<NodeIdentity>> {
    let expr = Regex::new(&format!("^{}.+$", regex::escape(prefix)))
        .map_err(|e| Error::Config(format!("hostname pattern: {e}")))?;
    let nodes = client.list_host_names(cancel, cluster)?;
    Ok(nodes
        .into_iter()
        .filter(|ni| expr.is_match(&ni.hostname))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_yaml(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cassandra.yaml");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_tokens_sorted_and_trimmed() {
        let (_dir, path) = write_yaml(
            "cluster_name: prod\n\
             listen_address: 10.0.0.4\n\
             partitioner: org.apache.cassandra.dht.Murmur3Partitioner\n\
             initial_token: ' 9000 , -100,42 ,'\n",
        );
        let cfg = load_cassandra_config(&path).unwrap();
        assert_eq!(cfg.cluster_name, "prod");
        assert_eq!(cfg.listen_address, "10.0.0.4");
        assert_eq!(cfg.tokens, vec!["-100", "42", "9000"]);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let (_dir, path) = write_yaml("cluster_name: minimal\n");
        let cfg = load_cassandra_config(&path).unwrap();
        assert_eq!(cfg.cluster_name, "minimal");
        assert!(cfg.listen_address.is_empty());
        assert!(cfg.tokens.is_empty());
    }

    #[test]
    fn template_takes_overrides() {
        let (_dir, path) = write_yaml(
            "cluster_name: real-cluster\nlisten_address: 10.1.1.1\npartitioner: p\n",
        );
        let (identity, template) =
            identity_and_template(&path, Some("other-cluster"), Some("forced-host")).unwrap();
        assert_eq!(identity.cluster, "other-cluster");
        assert_eq!(identity.hostname, "forced-host");
        assert_eq!(template.address, "10.1.1.1");
        assert_eq!(template.manifest_type, ManifestType::Invalid);
        assert!(template.data_files.is_empty());
    }
}
