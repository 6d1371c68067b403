pub mod download_plan;
pub mod filter;
pub mod plan;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use cassbak_types::{Error, Result, Seconds};

use crate::bucket::BucketClient;
use crate::cancel::CancelToken;
use crate::digest::DigestCache;
use crate::manifests::ManifestType;
use crate::nodeidentity;
use crate::writefile::TargetConfig;

use download_plan::{DownloadPlan, PREVIOUS_VERSIONS_DIR};
use filter::Filter;
use worker::RestoreWorker;

pub struct RestoreContext {
    pub cancel: CancelToken,
    pub client: Arc<dyn BucketClient>,
    pub digest_cache: DigestCache,
    pub cassandra_config: PathBuf,
}

#[derive(Debug, Default)]
pub struct HostRestoreOptions {
    pub cluster: Option<String>,
    pub hostname: Option<String>,
    pub hostname_pattern: Option<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub dry_run: bool,
    pub allow_changed: bool,
    /// Where the node's data lives; the live data directory in production.
    pub data_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct ClusterRestoreOptions {
    pub target: PathBuf,
    pub cluster: String,
    pub hostname_pattern: String,
    pub tables: Vec<String>,
    pub skip_indexes: bool,
    pub not_before: i64,
    pub not_after: i64,
    pub dry_run: bool,
}

/// Restore this node from its latest snapshot plus subsequent
/// incrementals. Changed files abort the restore unless explicitly allowed.
pub fn restore_host(ctx: &RestoreContext, opts: &HostRestoreOptions) -> Result<()> {
    let identity = nodeidentity::for_restore(
        &ctx.cancel,
        ctx.client.as_ref(),
        &ctx.cassandra_config,
        opts.cluster.as_deref(),
        opts.hostname.as_deref(),
        opts.hostname_pattern.as_deref(),
    )?;

    let node_plan = plan::create(
        &ctx.cancel,
        ctx.client.as_ref(),
        &identity,
        Seconds(opts.not_before),
        Seconds(opts.not_after),
    )?;

    if node_plan.selected_manifests.is_empty() {
        return Err(Error::NoBackupsFound);
    }
    if node_plan.selected_manifests[0].manifest_type != ManifestType::Snapshot {
        return Err(Error::NoSnapshotsFound);
    }
    info!(
        identity = %identity,
        base = %node_plan.selected_manifests[0],
        additional = node_plan.selected_manifests.len() - 1,
        "selected manifests"
    );

    if !node_plan.changed_files.is_empty() {
        for (name, history) in &node_plan.changed_files {
            for entry in history {
                info!(name = %name, digest = %entry.digest, manifest = %entry.manifest, "file changed");
            }
        }
        if !opts.allow_changed {
            return Err(Error::ChangesDetected);
        }
    }

    if opts.dry_run {
        for (name, digest) in &node_plan.files {
            info!(name = %name, digest = %digest, "would download");
        }
        return Ok(());
    }

    let target = TargetConfig::cassandra_node(&opts.data_dir)?;
    let restorer = RestoreWorker::new(Arc::clone(&ctx.client), ctx.digest_cache.clone(), target);
    restorer.restore_files(&ctx.cancel, &node_plan.files)
}

/// Download many hosts' backups under one target directory, keeping every
/// historical version of changed files.
pub fn restore_cluster(ctx: &RestoreContext, opts: &ClusterRestoreOptions) -> Result<()> {
    let table_filter = Filter::build(&opts.tables, !opts.skip_indexes)?;
    let identities = nodeidentity::matching_cluster_hosts(
        &ctx.cancel,
        ctx.client.as_ref(),
        &opts.cluster,
        &opts.hostname_pattern,
    )?;
    info!(count = identities.len(), "selected hosts");

    let mut download = DownloadPlan::default();
    for identity in identities {
        let mut node_plan = plan::create(
            &ctx.cancel,
            ctx.client.as_ref(),
            &identity,
            Seconds(opts.not_before),
            Seconds(opts.not_after),
        )?;
        if node_plan.selected_manifests.is_empty() {
            warn!(identity = %identity, "no backups found");
            continue;
        }
        if node_plan.selected_manifests[0].manifest_type != ManifestType::Snapshot {
            warn!(identity = %identity, "no snapshots found");
            continue;
        }
        info!(
            identity = %identity,
            base = %node_plan.selected_manifests[0],
            additional = node_plan.selected_manifests.len() - 1,
            "selected manifests"
        );
        table_filter.apply(&mut node_plan);
        download.add_host(&identity.hostname, node_plan);
    }

    let files = download.include_changed(PREVIOUS_VERSIONS_DIR);
    if opts.dry_run {
        for (name, digest) in &files {
            info!(name = %name, digest = %digest, "would download");
        }
        return Ok(());
    }

    let target = TargetConfig::plain(&opts.target);
    let restorer = RestoreWorker::new(Arc::clone(&ctx.client), ctx.digest_cache.clone(), target);
    restorer.restore_files(&ctx.cancel, &files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Storage;
    use crate::config::Provider;
    use crate::digest::{Blake2bDigest, ForRestore};
    use crate::manifests::{Manifest, NodeIdentity};
    use crate::testutil::MemoryBucketClient;
    use std::collections::BTreeMap;

    fn digest(seed: u8) -> ForRestore {
        ForRestore(Blake2bDigest::from_slice(&[seed; 64]).unwrap())
    }

    fn identity() -> NodeIdentity {
        NodeIdentity {
            cluster: "c1".into(),
            hostname: "cass-1".into(),
        }
    }

    fn manifest(time: i64, manifest_type: ManifestType, files: &[(&str, ForRestore)]) -> Manifest {
        Manifest {
            time: Seconds(time),
            manifest_type,
            host_id: String::new(),
            address: String::new(),
            partitioner: String::new(),
            tokens: Vec::new(),
            data_files: files
                .iter()
                .map(|(name, d)| (name.to_string(), *d))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn context(client: Arc<MemoryBucketClient>) -> (tempfile::TempDir, RestoreContext) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("cache.db")).unwrap();
        let ctx = RestoreContext {
            cancel: CancelToken::new(),
            client: client as Arc<dyn BucketClient>,
            digest_cache: DigestCache::new(&storage, Provider::Aws, 1024),
            cassandra_config: dir.path().join("missing-cassandra.yaml"),
        };
        (dir, ctx)
    }

    fn host_opts(dry_run: bool, allow_changed: bool) -> HostRestoreOptions {
        HostRestoreOptions {
            cluster: Some("c1".into()),
            hostname: Some("cass-1".into()),
            dry_run,
            allow_changed,
            data_dir: PathBuf::from("/nonexistent"),
            ..HostRestoreOptions::default()
        }
    }

    #[test]
    fn change_detection_aborts_without_allow_changed() {
        let client = Arc::new(MemoryBucketClient::new());
        client.seed_manifest(
            &identity(),
            &manifest(100, ManifestType::Snapshot, &[("ks/t-1/x.db", digest(1))]),
        );
        client.seed_manifest(
            &identity(),
            &manifest(150, ManifestType::Incremental, &[("ks/t-1/x.db", digest(2))]),
        );
        let (_dir, ctx) = context(client);

        // Without --allow-changed the changed file is fatal, dry run or not.
        let err = restore_host(&ctx, &host_opts(true, false)).unwrap_err();
        assert!(matches!(err, Error::ChangesDetected), "got: {err}");

        // With it, the dry run proceeds and selects the latest digest.
        restore_host(&ctx, &host_opts(true, true)).unwrap();
    }

    #[test]
    fn missing_snapshot_distinguishes_errors() {
        let client = Arc::new(MemoryBucketClient::new());
        let (_dir, ctx) = context(Arc::clone(&client));
        let err = restore_host(&ctx, &host_opts(true, false)).unwrap_err();
        assert!(matches!(err, Error::NoBackupsFound), "got: {err}");

        client.seed_manifest(
            &identity(),
            &manifest(100, ManifestType::Incremental, &[("ks/t-1/x.db", digest(1))]),
        );
        let err = restore_host(&ctx, &host_opts(true, false)).unwrap_err();
        assert!(matches!(err, Error::NoSnapshotsFound), "got: {err}");
    }

    #[test]
    fn cluster_restore_merges_hosts_and_skips_snapshotless() {
        let client = Arc::new(MemoryBucketClient::new());
        let host_a = NodeIdentity {
            cluster: "c1".into(),
            hostname: "cass-1".into(),
        };
        let host_b = NodeIdentity {
            cluster: "c1".into(),
            hostname: "cass-2".into(),
        };
        client.seed_manifest(
            &host_a,
            &manifest(100, ManifestType::Snapshot, &[("ks/t-1/a.db", digest(1))]),
        );
        // host_b has incrementals only: skipped with a warning.
        client.seed_manifest(
            &host_b,
            &manifest(100, ManifestType::Incremental, &[("ks/t-1/b.db", digest(2))]),
        );

        let target = tempfile::tempdir().unwrap();
        let (_dir, ctx) = context(Arc::clone(&client));
        let opts = ClusterRestoreOptions {
            target: target.path().to_path_buf(),
            cluster: "c1".into(),
            hostname_pattern: "cass".into(),
            tables: vec!["ks.t".into()],
            skip_indexes: true,
            dry_run: true,
            ..ClusterRestoreOptions::default()
        };
        restore_cluster(&ctx, &opts).unwrap();
    }
}
