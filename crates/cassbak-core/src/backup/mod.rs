pub mod cleanup;
mod finish;
pub mod pathprocessor;
mod prospect;
mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::bounded;
use tracing::error;

use cassbak_types::{Error, Result, Seconds};

use crate::bucket::{BucketClient, PutBlobOutcome};
use crate::cancel::CancelToken;
use crate::digest::{DigestCache, ForUpload};
use crate::manifests::{Manifest, ManifestType, NodeIdentity};
use crate::nodetool;
use crate::paranoid;

use cleanup::{CleanupHandler, IncrementalCleanup, SnapshotCleanup};
use pathprocessor::{IncrementalPathProcessor, PathProcessor, SnapshotPathProcessor};

pub const DATA_DIR: &str = "/var/lib/cassandra/data";

/// Everything a backup run needs, constructed once per process and handed
/// down rather than reached for through globals.
pub struct BackupContext {
    pub cancel: CancelToken,
    pub client: Arc<dyn BucketClient>,
    pub digest_cache: DigestCache,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalOptions {
    pub clean: bool,
    pub verbose_clean: bool,
}

/// One file travelling the pipeline, or an error sentinel standing in for
/// one. Exactly one of the error fields is ever set, and only sentinels
/// omit the file and manifest path.
struct FileRecord {
    manifest_path: String,
    file: Option<paranoid::File>,
    digests: Option<ForUpload>,
    prospect_error: Option<Error>,
    upload_outcome: Option<Result<PutBlobOutcome>>,
}

impl FileRecord {
    fn prospect_sentinel(e: Error) -> Self {
        FileRecord {
            manifest_path: String::new(),
            file: None,
            digests: None,
            prospect_error: Some(e),
            upload_outcome: None,
        }
    }
}

/// Upload the node's incremental `backups/` directories and, on a fully
/// clean run with cleaning enabled, delete the uploaded source files.
pub fn incremental(
    ctx: &BackupContext,
    identity: &NodeIdentity,
    mut manifest: Manifest,
    opts: IncrementalOptions,
) -> Result<()> {
    manifest.manifest_type = ManifestType::Incremental;
    let processor = IncrementalPathProcessor::default();
    let mut cleanup = IncrementalCleanup::new(opts.clean, opts.verbose_clean);
    run_pipeline(ctx, identity, manifest, &processor, &mut cleanup)
}

/// Take a nodetool snapshot, upload it, and clear it afterwards whatever
/// happens.
pub fn snapshot(ctx: &BackupContext, identity: &NodeIdentity, mut manifest: Manifest) -> Result<()> {
    let now = Seconds::now();
    let name = format!("auto-{}", now.decimal());
    nodetool::take_snapshot(&name)?;

    manifest.time = now;
    manifest.manifest_type = ManifestType::Snapshot;
    let processor = SnapshotPathProcessor { name: name.clone() };
    let mut cleanup = SnapshotCleanup { name };
    run_pipeline(ctx, identity, manifest, &processor, &mut cleanup)
}

/// prospect --(cap 1)--> upload --(cap 1)--> finish, with cleanup executing
/// unconditionally after finish returns.
fn run_pipeline(
    ctx: &BackupContext,
    identity: &NodeIdentity,
    manifest: Manifest,
    processor: &(dyn PathProcessor + Sync),
    cleanup: &mut dyn CleanupHandler,
) -> Result<()> {
    let cancel = &ctx.cancel;
    let client = ctx.client.as_ref();
    let digest_cache = &ctx.digest_cache;
    let data_dir = ctx.data_dir.as_path();

    let result = std::thread::scope(|s| {
        let (prospect_tx, prospect_rx) = bounded::<FileRecord>(1);
        let (upload_tx, upload_rx) = bounded::<FileRecord>(1);

        s.spawn(move || prospect::run(cancel, digest_cache, data_dir, processor, prospect_tx));
        s.spawn(move || upload::run(cancel, client, prospect_rx, upload_tx));

        finish::run(cancel, client, identity, manifest, cleanup, upload_rx)
    });

    let cleanup_result = cleanup.execute();
    match (result, cleanup_result) {
        (Err(e), Err(cleanup_err)) => {
            error!(error = %cleanup_err, "cleanup failed");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(cleanup_err)) => {
            error!(error = %cleanup_err, "cleanup failed");
            Err(cleanup_err)
        }
        (Ok(()), Ok(())) => Ok(()),
    }
}
