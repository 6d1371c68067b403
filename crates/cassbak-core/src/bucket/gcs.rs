use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
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
use super::{BucketClient, PutBlobOutcome};

const STORAGE_HOST: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

pub struct GcsClient {
    agent: ureq::Agent,
    key_store: KeyStore,
    exists_cache: ExistsCache,
    token: TokenSource,
    /// Bucket-level retention period, discovered at startup. Objects whose
    /// metadata carries no explicit retention expiry are assumed locked for
    /// this long from "now".
    retention_period: Option<i64>,
}

impl GcsClient {
    pub fn new(config: &Config, storage: &Arc<Storage>) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let mut client = GcsClient {
            agent,
            key_store: KeyStore::new(&config.bucket, &config.key_prefix),
            exists_cache: ExistsCache::new(storage),
            token: TokenSource::default(),
            retention_period: None,
        };
        client.retention_period = client.discover_retention_period()?;
        Ok(client)
    }

    fn discover_retention_period(&self) -> Result<Option<i64>> {
        let url = format!(
            "{STORAGE_HOST}/storage/v1/b/{}?fields=retentionPolicy",
            self.key_store.bucket
        );
        let body = self
            .authed(self.agent.get(&url))?
            .call()
            .map_err(|e| Error::Config(format!("failed to read bucket metadata: {e}")))?
            .into_string()
            .map_err(|e| Error::Config(format!("bucket metadata body: {e}")))?;

        #[derive(Deserialize)]
        struct BucketMeta {
            #[serde(rename = "retentionPolicy")]
            retention_policy: Option<RetentionPolicy>,
        }
        #[derive(Deserialize)]
        struct RetentionPolicy {
            #[serde(rename = "retentionPeriod")]
            retention_period: String,
        }
        let meta: BucketMeta = serde_json::from_str(&body)
            .map_err(|e| Error::Config(format!("bucket metadata decode: {e}")))?;
        match meta.retention_policy {
            Some(policy) => Ok(policy.retention_period.parse().ok()),
            None => {
                warn!(
                    bucket = %self.key_store.bucket,
                    "bucket has no retention policy; exists-cache entries will not be recorded"
                );
                Ok(None)
            }
        }
    }

    fn authed(&self, req: ureq::Request) -> Result<ureq::Request> {
        let token = self.token.get(&self.agent)?;
        Ok(req.set("Authorization", &format!("Bearer {token}")))
    }

    /// Object path on the XML-style endpoint, with the key percent-encoded
    /// as a single path segment.
    fn object_url(&self, key: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        format!("{STORAGE_HOST}/{}/{encoded}", self.key_store.bucket)
    }

    fn object_meta_url(&self, key: &str, fields: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        format!(
            "{STORAGE_HOST}/storage/v1/b/{}/o/{encoded}?fields={fields}",
            self.key_store.bucket
        )
    }

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

        let url = self.object_meta_url(key, "size,retentionExpirationTime");
        let resp = match self.authed(self.agent.get(&url))?.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(false),
            Err(e) => {
                cancel.check()?;
                return Err(Error::Storage(format!("GCS metadata {key}: {e}")));
            }
        };

        #[derive(Deserialize)]
        struct ObjectMeta {
            size: String,
            #[serde(rename = "retentionExpirationTime")]
            retention_expiration_time: Option<String>,
        }
        let meta: ObjectMeta = serde_json::from_reader(resp.into_reader())
            .map_err(|e| Error::Storage(format!("GCS metadata {key}: decode: {e}")))?;

        let actual_length: u64 = meta.size.parse().unwrap_or(0);
        if actual_length != expected_length {
            info!(key, expected = expected_length, actual = actual_length, "blob metadata saw wrong length");
            return Ok(false);
        }

        let retained_until = match meta.retention_expiration_time.as_deref() {
            Some(raw) => Seconds::parse_rfc3339(raw).ok(),
            None => self
                .retention_period
                .map(|period| Seconds(Seconds::now().0 + period)),
        };
        if let Some(retained_until) = retained_until {
            self.exists_cache.put(restore, retained_until);
        }
        Ok(true)
    }

    /// Single streaming write; GCS verifies the whole object against the
    /// precomputed MD5 presented in `x-goog-hash`.
    fn upload_file(
        &self,
        key: &str,
        file: &paranoid::File,
        md5: &[u8; 16],
        total_length: u64,
    ) -> Result<()> {
        let os_file = file.open()?;
        let url = self.object_url(key);
        self.authed(self.agent.put(&url))?
            .set("x-goog-hash", &format!("md5={}", STANDARD.encode(md5)))
            .set("Content-Length", &total_length.to_string())
            .send(os_file)
            .map_err(|e| Error::Storage(format!("GCS PUT {key}: {e}")))?;
        debug!(key, total_length, "object upload complete");
        Ok(())
    }

    fn list_page(&self, url: &str) -> Result<ListResponse> {
        let resp = self
            .authed(self.agent.get(url))?
            .call()
            .map_err(|e| Error::Storage(format!("GCS LIST: {e}")))?;
        serde_json::from_reader(resp.into_reader())
            .map_err(|e| Error::Storage(format!("GCS LIST: decode: {e}")))
    }

    fn list_url(&self, prefix: &str, start_offset: Option<&str>, page_token: Option<&str>) -> String {
        let mut url = url::Url::parse(STORAGE_HOST).expect("static url");
        url.set_path(&format!("storage/v1/b/{}/o", self.key_store.bucket));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", prefix);
            query.append_pair("delimiter", "/");
            if let Some(start) = start_offset {
                query.append_pair("startOffset", start);
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        url.into()
    }
}

#[derive(Deserialize, Default)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

impl BucketClient for GcsClient {
    fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    fn put_blob(
        &self,
        cancel: &CancelToken,
        file: &paranoid::File,
        digests: &ForUpload,
    ) -> Result<PutBlobOutcome> {
        let ForUpload::Gcs {
            md5, total_length, ..
        } = digests
        else {
            return Err(Error::Other(
                "GCS client handed a non-GCS digest bundle".into(),
            ));
        };
        let restore = digests.for_restore();
        let key = self.key_store.blob_key(&restore);

        if self.blob_exists(cancel, &key, &restore, *total_length)? {
            return Ok(PutBlobOutcome::Skipped);
        }

        match self.upload_file(&key, file, md5, *total_length) {
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
        let url = self.object_url(&key);

        retry(cancel, "get blob", BLOB_RETRIES, || {
            cancel.check()?;
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            let resp = match self.authed(self.agent.get(&url))?.call() {
                Ok(resp) => resp,
                Err(ureq::Error::Status(404, _)) => return Err(Error::NotFound(key.clone())),
                Err(e) => return Err(Error::Storage(format!("GCS GET {key}: {e}"))),
            };
            std::io::copy(&mut resp.into_reader(), file)
                .map_err(|e| Error::Storage(format!("GCS GET {key}: body: {e}")))?;
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
        let url = self.object_url(&key);

        retry(cancel, "put manifest", MANIFEST_RETRIES, || {
            cancel.check()?;
            self.authed(self.agent.put(&url))?
                .set("Content-Type", "application/json")
                .set("Content-Encoding", "gzip")
                .send_bytes(&body)
                .map_err(|e| Error::Storage(format!("GCS PUT {key}: {e}")))?;
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
        let url = self.object_url(&object_key);

        let body = retry(cancel, "get manifest", MANIFEST_RETRIES, || {
            cancel.check()?;
            let resp = match self.authed(self.agent.get(&url))?.call() {
                Ok(resp) => resp,
                Err(ureq::Error::Status(404, _)) => {
                    return Err(Error::NotFound(object_key.clone()))
                }
                Err(e) => return Err(Error::Storage(format!("GCS GET {object_key}: {e}"))),
            };
            let mut body = Vec::new();
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(|e| Error::Storage(format!("GCS GET {object_key}: body: {e}")))?;
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
        let start_key = self
            .key_store
            .manifest_time_range_key(identity, start_after)?;

        let keys = retry(cancel, "list manifests", LIST_RETRIES, || {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                cancel.check()?;
                let url = self.list_url(&prefix, Some(&start_key), token.as_deref());
                let page = self.list_page(&url)?;
                for item in &page.items {
                    let name = item.name.rsplit('/').next().unwrap_or(&item.name);
                    match ManifestKey::from_file_name(name) {
                        Ok(key) => keys.push(key),
                        Err(_) => warn!(name, "ignoring non-manifest object under host prefix"),
                    }
                }
                match page.next_page_token {
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
                let url = self.list_url(&prefix, None, token.as_deref());
                let page = self.list_page(&url)?;
                for raw in &page.prefixes {
                    match self.key_store.node_identity_from_key(raw) {
                        Ok(identity) => identities.push(identity),
                        Err(_) => warn!(key = %raw, "unexpected prefix in bucket"),
                    }
                }
                if !page.items.is_empty() {
                    let unexpected: Vec<&str> =
                        page.items.iter().map(|i| i.name.as_str()).collect();
                    warn!(keys = ?unexpected, "unexpected objects in bucket");
                }
                match page.next_page_token {
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
                let url = self.list_url(&prefix, None, token.as_deref());
                let page = self.list_page(&url)?;
                for raw in &page.prefixes {
                    match self.key_store.decode_cluster(raw) {
                        Ok(cluster) => clusters.push(cluster),
                        Err(e) => warn!(key = %raw, error = %e, "failed to decode cluster prefix"),
                    }
                }
                match page.next_page_token {
                    Some(t) => token = Some(t),
                    None => break,
                }
            }
            clusters.sort();
            Ok(clusters)
        })
    }
}

/// Bearer tokens from the environment or the GCE metadata server, cached
/// until shortly before expiry.
#[derive(Default)]
struct TokenSource {
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSource {
    fn get(&self, agent: &ureq::Agent) -> Result<String> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                return Ok(token);
            }
        }

        let mut cached = self.cached.lock().unwrap();
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }
        let resp: TokenResponse = agent
            .get(METADATA_TOKEN_URL)
            .set("Metadata-Flavor", "Google")
            .call()
            .map_err(|e| Error::Config(format!("metadata server token fetch failed: {e}")))
            .and_then(|r| {
                serde_json::from_reader(r.into_reader())
                    .map_err(|e| Error::Config(format!("metadata server token decode: {e}")))
            })?;

        // Refresh a minute early so in-flight requests never carry a token
        // that expires mid-transfer.
        let expires_at =
            Instant::now() + Duration::from_secs(resp.expires_in.saturating_sub(60).max(1));
        *cached = Some((resp.access_token.clone(), expires_at));
        Ok(resp.access_token)
    }
}
