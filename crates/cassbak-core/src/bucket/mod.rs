pub mod existscache;
pub mod gcs;
pub mod retry;
pub mod s3;
mod s3_uploader;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use cassbak_types::{Result, Seconds};

use crate::cache::Storage;
use crate::cancel::CancelToken;
use crate::config::{Config, Provider};
use crate::digest::{ForRestore, ForUpload};
use crate::keystore::KeyStore;
use crate::manifests::{Manifest, ManifestKey, NodeIdentity};
use crate::paranoid;

pub(crate) const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// How a PutBlob call ended. A skip means the bucket already holds the
/// blob; finish treats it exactly like a successful upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBlobOutcome {
    Uploaded,
    Skipped,
}

/// Provider-polymorphic bucket operations. One implementation is chosen at
/// startup; provider-specific details (part concurrency, MD5 headers,
/// object-lock retention) never cross this boundary.
pub trait BucketClient: Send + Sync {
    fn key_store(&self) -> &KeyStore;

    /// Upload one file's bytes under its content-addressed key, unless the
    /// bucket is already known (or found) to hold them.
    fn put_blob(
        &self,
        cancel: &CancelToken,
        file: &paranoid::File,
        digests: &ForUpload,
    ) -> Result<PutBlobOutcome>;

    /// Download a blob into `file` (truncating it first) and verify the
    /// downloaded bytes against the addressing digest.
    fn get_blob(
        &self,
        cancel: &CancelToken,
        digests: &ForRestore,
        file: &mut fs::File,
    ) -> Result<()>;

    fn put_manifest(
        &self,
        cancel: &CancelToken,
        identity: &NodeIdentity,
        manifest: &Manifest,
    ) -> Result<()>;

    fn get_manifest(
        &self,
        cancel: &CancelToken,
        identity: &NodeIdentity,
        key: &ManifestKey,
    ) -> Result<Manifest>;

    /// List manifest keys for a host whose time is at or after
    /// `start_after` and, when `not_after` is positive, strictly before it.
    fn list_manifests(
        &self,
        cancel: &CancelToken,
        identity: &NodeIdentity,
        start_after: Seconds,
        not_after: Seconds,
    ) -> Result<Vec<ManifestKey>>;

    fn list_host_names(&self, cancel: &CancelToken, cluster: &str) -> Result<Vec<NodeIdentity>>;

    fn list_clusters(&self, cancel: &CancelToken) -> Result<Vec<String>>;
}

/// Construct the configured provider's client. The startup checks (bucket
/// SSE for S3, retention discovery for GCS) run here, so an unusable bucket
/// fails the process before any backup work begins.
pub fn open_client(config: &Config, storage: &Arc<Storage>) -> Result<Arc<dyn BucketClient>> {
    match config.provider {
        Provider::Aws => Ok(Arc::new(s3::S3Client::new(config, storage)?)),
        Provider::Google => Ok(Arc::new(gcs::GcsClient::new(config, storage)?)),
    }
}

/// Fetch a set of manifests in key order.
pub fn get_manifests(
    client: &dyn BucketClient,
    cancel: &CancelToken,
    identity: &NodeIdentity,
    keys: &[ManifestKey],
) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::with_capacity(keys.len());
    for key in keys {
        cancel.check()?;
        manifests.push(client.get_manifest(cancel, identity, key)?);
    }
    Ok(manifests)
}

/// Apply the listing time bounds shared by both providers.
///
/// The bounds behave like the bare fixed-width time keys they are derived
/// from: a manifest name `{t}.{type}.json` sorts after the boundary `{t}`,
/// so the window is inclusive at `start_after` and exclusive at `not_after`.
pub(crate) fn filter_manifest_keys(
    mut keys: Vec<ManifestKey>,
    start_after: Seconds,
    not_after: Seconds,
) -> Vec<ManifestKey> {
    keys.retain(|k| k.time >= start_after && (not_after.0 <= 0 || k.time < not_after));
    keys.sort();
    keys
}
