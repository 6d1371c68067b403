use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, ListObjectsV2Response, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::{debug, info, warn};

use cassbak_types::{Error, Result, Seconds};

use crate::cache::Storage;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::digest::{ForRestore, ForUpload};
use crate::keystore::KeyStore;
use crate::manifests::{Manifest, ManifestKey, NodeIdentity};
use crate::paranoid;

use super::existscache::ExistsCache;
use super::retry::{retry, BLOB_RETRIES, LIST_RETRIES, MANIFEST_RETRIES};
use super::s3_uploader::SafeUploader;
use super::{BucketClient, PutBlobOutcome, PRESIGN_DURATION};

pub(crate) const SSE_HEADER: &str = "x-amz-server-side-encryption";
pub(crate) const SSE_ALGORITHM: &str = "AES256";
pub(crate) const STORAGE_CLASS_HEADER: &str = "x-amz-storage-class";

pub struct S3Client {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    key_store: KeyStore,
    exists_cache: ExistsCache,
    storage_class: String,
}

impl S3Client {
    pub fn new(config: &Config, storage: &Arc<Storage>) -> Result<Self> {
        let region = config
            .s3_region
            .as_deref()
            .ok_or_else(|| Error::Config("s3 region is required".into()))?;
        let endpoint = format!("https://s3.{region}.amazonaws.com")
            .parse()
            .map_err(|e| Error::Config(format!("invalid S3 endpoint: {e}")))?;
        let bucket = Bucket::new(
            endpoint,
            UrlStyle::VirtualHost,
            config.bucket.clone(),
            region.to_string(),
        )
        .map_err(|e| Error::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::from_env().ok_or_else(|| {
            Error::Config("AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY not set".into())
        })?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let client = S3Client {
            bucket,
            credentials,
            agent,
            key_store: KeyStore::new(&config.bucket, &config.key_prefix),
            exists_cache: ExistsCache::new(storage),
            storage_class: config.s3_storage_class.clone(),
        };
        client.verify_bucket_encryption()?;
        Ok(client)
    }

    /// Refuse to run against a bucket without a default SSE rule: blobs are
    /// stored plaintext by this tool and rely on bucket-side encryption.
    fn verify_bucket_encryption(&self) -> Result<()> {
        let mut action = self.bucket.get_object(Some(&self.credentials), "");
        action.query_mut().insert("encryption", "");
        let url = action.sign(PRESIGN_DURATION);

        let body = match self.agent.get(url.as_str()).call() {
            Ok(resp) => resp.into_string().map_err(|e| {
                Error::Config(format!("failed to read bucket encryption config: {e}"))
            })?,
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to validate bucket encryption: {e}"
                )))
            }
        };
        if !body.contains("SSEAlgorithm") {
            return Err(Error::Config(format!(
                "bucket {} has no default server-side encryption rule",
                self.key_store.bucket
            )));
        }
        Ok(())
    }

    fn uploader(&self) -> SafeUploader<'_> {
        SafeUploader {
            bucket: &self.bucket,
            credentials: &self.credentials,
            agent: &self.agent,
            storage_class: &self.storage_class,
        }
    }

    /// Exists-cache first, then a live HEAD. A HEAD that finds the object
    /// but with the wrong length or a delete marker reports "absent" so the
    /// blob is re-uploaded under the same key.
    fn blob_exists(
        &self,
        cancel: &CancelToken,
        key: &str,
        restore: &ForRestore,
        expected_length: u64,
    ) -> Result<bool> {
        if self.exists_cache.get(restore) {
            return Ok(true);
        }

        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let resp = match self.agent.head(url.as_str()).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(false),
            Err(e) => {
                cancel.check()?;
                return Err(Error::Storage(format!("HEAD {key}: {e}")));
            }
        };

        if resp.header("x-amz-delete-marker") == Some("true") {
            info!(key, "blob HEAD saw delete marker");
            return Ok(false);
        }
        let actual_length: u64 = resp
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if actual_length != expected_length {
            info!(key, expected = expected_length, actual = actual_length, "blob HEAD saw wrong length");
            return Ok(false);
        }

        if let Some(raw) = resp.header("x-amz-object-lock-retain-until-date") {
            if let Ok(retained_until) = Seconds::parse_rfc3339(raw) {
                self.exists_cache.put(restore, retained_until);
            }
        }
        Ok(true)
    }
}

impl BucketClient for S3Client {
    fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    fn put_blob(
        &self,
        cancel: &CancelToken,
        file: &paranoid::File,
        digests: &ForUpload,
    ) -> Result<PutBlobOutcome> {
        let ForUpload::S3 { parts, .. } = digests else {
            return Err(Error::Other(
                "S3 client handed a non-S3 digest bundle".into(),
            ));
        };
        let restore = digests.for_restore();
        let key = self.key_store.blob_key(&restore);

        if self.blob_exists(cancel, &key, &restore, digests.total_length())? {
            return Ok(PutBlobOutcome::Skipped);
        }

        match self.uploader().upload_file(cancel, &key, file, parts) {
            Ok(()) => Ok(PutBlobOutcome::Uploaded),
            Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(e),
        }
    }

    fn get_blob(
        &self,
        cancel: &CancelToken,
        digests: &ForRestore,
        file: &mut fs::File,
    ) -> Result<()> {
        let key = self.key_store.blob_key(digests);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &key)
            .sign(PRESIGN_DURATION);

        retry(cancel, "get blob", BLOB_RETRIES, || {
            cancel.check()?;
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            let resp = match self.agent.get(url.as_str()).call() {
                Ok(resp) => resp,
                Err(ureq::Error::Status(404, _)) => return Err(Error::NotFound(key.clone())),
                Err(e) => return Err(Error::Storage(format!("GET {key}: {e}"))),
            };
            std::io::copy(&mut resp.into_reader(), file)
                .map_err(|e| Error::Storage(format!("GET {key}: body: {e}")))?;
            Ok(())
        })?;

        digests.verify(cancel, file)
    }

    fn put_manifest(
        &self,
        cancel: &CancelToken,
        identity: &NodeIdentity,
        manifest: &Manifest,
    ) -> Result<()> {
        let key = self.key_store.manifest_key(identity, &manifest.key())?;
        let body = manifest.encode()?;

        retry(cancel, "put manifest", MANIFEST_RETRIES, || {
            cancel.check()?;
            let mut action = self.bucket.put_object(Some(&self.credentials), &key);
            action.headers_mut().insert("content-type", "application/json");
            action.headers_mut().insert("content-encoding", "gzip");
            action.headers_mut().insert(SSE_HEADER, SSE_ALGORITHM);
            let url = action.sign(PRESIGN_DURATION);
            self.agent
                .put(url.as_str())
                .set("Content-Type", "application/json")
                .set("Content-Encoding", "gzip")
                .set(SSE_HEADER, SSE_ALGORITHM)
                .send_bytes(&body)
                .map_err(|e| Error::Storage(format!("PUT {key}: {e}")))?;
            Ok(())
        })
    }

    fn get_manifest(
        &self,
        cancel: &CancelToken,
        identity: &NodeIdentity,
        key: &ManifestKey,
    ) -> Result<Manifest> {
        let object_key = self.key_store.manifest_key(identity, key)?;
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &object_key)
            .sign(PRESIGN_DURATION);

        let body = retry(cancel, "get manifest", MANIFEST_RETRIES, || {
            cancel.check()?;
            let resp = match self.agent.get(url.as_str()).call() {
                Ok(resp) => resp,
                Err(ureq::Error::Status(404, _)) => {
                    return Err(Error::NotFound(object_key.clone()))
                }
                Err(e) => return Err(Error::Storage(format!("GET {object_key}: {e}"))),
            };
            let mut body = Vec::new();
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(|e| Error::Storage(format!("GET {object_key}: body: {e}")))?;
            Ok(body)
        })?;
        Manifest::decode(&body)
    }

    fn list_manifests(
        &self,
        cancel: &CancelToken,
        identity: &NodeIdentity,
        start_after: Seconds,
        not_after: Seconds,
    ) -> Result<Vec<ManifestKey>> {
        let prefix = self.key_store.manifests_prefix(identity)?;
        let start_after_key = self
            .key_store
            .manifest_time_range_key(identity, start_after)?;

        let keys = retry(cancel, "list manifests", LIST_RETRIES, || {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                cancel.check()?;
                let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
                action.query_mut().insert("prefix", &prefix);
                action.query_mut().insert("delimiter", "/");
                action.query_mut().insert("start-after", &start_after_key);
                if let Some(t) = &token {
                    action.query_mut().insert("continuation-token", t);
                }
                let url = action.sign(PRESIGN_DURATION);

                let parsed = self.fetch_listing(&url, &prefix)?;
                for obj in &parsed.contents {
                    let name = obj.key.rsplit('/').next().unwrap_or(&obj.key);
                    match ManifestKey::from_file_name(name) {
                        Ok(key) => keys.push(key),
                        Err(_) => warn!(name, "ignoring non-manifest object under host prefix"),
                    }
                }
                match parsed.next_continuation_token {
                    Some(t) => token = Some(t),
                    None => break,
                }
            }
            Ok(keys)
        })?;

        Ok(super::filter_manifest_keys(keys, start_after, not_after))
    }

    fn list_host_names(&self, cancel: &CancelToken, cluster: &str) -> Result<Vec<NodeIdentity>> {
        let prefix = self.key_store.cluster_hosts_prefix(cluster)?;
        retry(cancel, "list hosts", LIST_RETRIES, || {
            let mut identities = Vec::new();
            let mut token: Option<String> = None;
            loop {
                cancel.check()?;
                let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
                action.query_mut().insert("prefix", &prefix);
                action.query_mut().insert("delimiter", "/");
                if let Some(t) = &token {
                    action.query_mut().insert("continuation-token", t);
                }
                let url = action.sign(PRESIGN_DURATION);

                let parsed = self.fetch_listing(&url, &prefix)?;
                for common in &parsed.common_prefixes {
                    match self.key_store.node_identity_from_key(&common.prefix) {
                        Ok(identity) => identities.push(identity),
                        Err(_) => warn!(key = %common.prefix, "unexpected prefix in bucket"),
                    }
                }
                if !parsed.contents.is_empty() {
                    let unexpected: Vec<&str> =
                        parsed.contents.iter().map(|o| o.key.as_str()).collect();
                    warn!(keys = ?unexpected, "unexpected objects in bucket");
                }
                match parsed.next_continuation_token {
                    Some(t) => token = Some(t),
                    None => break,
                }
            }
            identities.sort();
            Ok(identities)
        })
    }

    fn list_clusters(&self, cancel: &CancelToken) -> Result<Vec<String>> {
        let prefix = self.key_store.clusters_prefix();
        retry(cancel, "list clusters", LIST_RETRIES, || {
            let mut clusters = Vec::new();
            let mut token: Option<String> = None;
            loop {
                cancel.check()?;
                let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
                action.query_mut().insert("prefix", &prefix);
                action.query_mut().insert("delimiter", "/");
                if let Some(t) = &token {
                    action.query_mut().insert("continuation-token", t);
                }
                let url = action.sign(PRESIGN_DURATION);

                let parsed = self.fetch_listing(&url, &prefix)?;
                for common in &parsed.common_prefixes {
                    match self.key_store.decode_cluster(&common.prefix) {
                        Ok(cluster) => clusters.push(cluster),
                        Err(e) => warn!(key = %common.prefix, error = %e, "failed to decode cluster prefix"),
                    }
                }
                match parsed.next_continuation_token {
                    Some(t) => token = Some(t),
                    None => break,
                }
            }
            clusters.sort();
            Ok(clusters)
        })
    }
}

impl S3Client {
    fn fetch_listing(&self, url: &url::Url, prefix: &str) -> Result<ListObjectsV2Response> {
        let resp = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| Error::Storage(format!("LIST {prefix}: {e}")))?;
        let mut body = Vec::new();
        resp.into_reader()
            .read_to_end(&mut body)
            .map_err(|e| Error::Storage(format!("LIST {prefix}: body: {e}")))?;
        debug!(prefix, bytes = body.len(), "listing page fetched");
        let body = std::str::from_utf8(&body)
            .map_err(|e| Error::Storage(format!("LIST {prefix}: body: {e}")))?;
        ListObjectsV2::parse_response(body)
            .map_err(|e| Error::Storage(format!("LIST {prefix}: parse: {e}")))
    }
}
