use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use cassbak_types::{Error, Result, Seconds};

use crate::bucket::{filter_manifest_keys, BucketClient, PutBlobOutcome};
use crate::cancel::CancelToken;
use crate::digest::{ForRestore, ForUpload};
use crate::keystore::KeyStore;
use crate::manifests::{Manifest, ManifestKey, NodeIdentity};
use crate::paranoid;

/// In-memory bucket for pipeline and restore tests: blobs and manifests in
/// maps, with enough accounting to assert on upload and skip behavior.
pub(crate) struct MemoryBucketClient {
    key_store: KeyStore,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    manifests: Mutex<BTreeMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
    fail_patterns: Mutex<Vec<Vec<u8>>>,
}

impl MemoryBucketClient {
    pub fn new() -> Self {
        MemoryBucketClient {
            key_store: KeyStore::new("memory", ""),
            blobs: Mutex::new(BTreeMap::new()),
            manifests: Mutex::new(BTreeMap::new()),
            uploads: AtomicUsize::new(0),
            fail_patterns: Mutex::new(Vec::new()),
        }
    }

    /// Make PutBlob fail for any file whose content contains `pattern`.
    pub fn fail_blob_containing(&self, pattern: &[u8]) {
        self.fail_patterns.lock().unwrap().push(pattern.to_vec());
    }

    /// Number of actual uploads (skips not counted).
    pub fn blob_uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn manifest_count(&self) -> usize {
        self.manifests.lock().unwrap().len()
    }

    pub fn raw_manifest(&self, identity: &NodeIdentity, key: &ManifestKey) -> Vec<u8> {
        let absolute = self.key_store.manifest_key(identity, key).unwrap();
        self.manifests.lock().unwrap()[&absolute].clone()
    }

    /// Insert a manifest directly, for planner tests.
    pub fn seed_manifest(&self, identity: &NodeIdentity, manifest: &Manifest) {
        let absolute = self
            .key_store
            .manifest_key(identity, &manifest.key())
            .unwrap();
        self.manifests
            .lock()
            .unwrap()
            .insert(absolute, manifest.encode().unwrap());
    }

    /// Insert a blob directly, for restore tests.
    pub fn seed_blob(&self, restore: &ForRestore, content: &[u8]) {
        let key = self.key_store.blob_key(restore);
        self.blobs.lock().unwrap().insert(key, content.to_vec());
    }
}

impl BucketClient for MemoryBucketClient {
    fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    fn put_blob(
        &self,
        _cancel: &CancelToken,
        file: &paranoid::File,
        digests: &ForUpload,
    ) -> Result<PutBlobOutcome> {
        let mut handle = file.open()?;
        let mut content = Vec::new();
        handle.read_to_end(&mut content)?;
        file.check_file(&handle)?;

        for pattern in self.fail_patterns.lock().unwrap().iter() {
            if content
                .windows(pattern.len().max(1))
                .any(|w| w == pattern.as_slice())
            {
                return Err(Error::Storage("injected upload failure".into()));
            }
        }

        let key = self.key_store.blob_key(&digests.for_restore());
        let mut blobs = self.blobs.lock().unwrap();
        if blobs.contains_key(&key) {
            return Ok(PutBlobOutcome::Skipped);
        }
        blobs.insert(key, content);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(PutBlobOutcome::Uploaded)
    }

    fn get_blob(
        &self,
        cancel: &CancelToken,
        digests: &ForRestore,
        file: &mut fs::File,
    ) -> Result<()> {
        let key = self.key_store.blob_key(digests);
        let content = self
            .blobs
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(&content)?;
        digests.verify(cancel, file)
    }

    fn put_manifest(
        &self,
        _cancel: &CancelToken,
        identity: &NodeIdentity,
        manifest: &Manifest,
    ) -> Result<()> {
        let absolute = self.key_store.manifest_key(identity, &manifest.key())?;
        self.manifests
            .lock()
            .unwrap()
            .insert(absolute, manifest.encode()?);
        Ok(())
    }

    fn get_manifest(
        &self,
        _cancel: &CancelToken,
        identity: &NodeIdentity,
        key: &ManifestKey,
    ) -> Result<Manifest> {
        let absolute = self.key_store.manifest_key(identity, key)?;
        let body = self
            .manifests
            .lock()
            .unwrap()
            .get(&absolute)
            .cloned()
            .ok_or_else(|| Error::NotFound(absolute.clone()))?;
        Manifest::decode(&body)
    }

    fn list_manifests(
        &self,
        _cancel: &CancelToken,
        identity: &NodeIdentity,
        start_after: Seconds,
        not_after: Seconds,
    ) -> Result<Vec<ManifestKey>> {
        let prefix = self.key_store.manifests_prefix(identity)?;
        let keys = self
            .manifests
            .lock()
            .unwrap()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|name| ManifestKey::from_file_name(name).ok())
            .collect();
        Ok(filter_manifest_keys(keys, start_after, not_after))
    }

    fn list_host_names(&self, _cancel: &CancelToken, cluster: &str) -> Result<Vec<NodeIdentity>> {
        let prefix = self.key_store.cluster_hosts_prefix(cluster)?;
        let mut identities: Vec<NodeIdentity> = self
            .manifests
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .filter_map(|k| {
                let host_prefix = &k[..k.rfind('/')? + 1];
                self.key_store.node_identity_from_key(host_prefix).ok()
            })
            .collect();
        identities.sort();
        identities.dedup();
        Ok(identities)
    }

    fn list_clusters(&self, _cancel: &CancelToken) -> Result<Vec<String>> {
        let prefix = self.key_store.clusters_prefix();
        let mut clusters: Vec<String> = self
            .manifests
            .lock()
            .unwrap()
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                let cluster_b64 = rest.split('/').next()?;
                self.key_store
                    .decode_cluster(&format!("{prefix}{cluster_b64}/"))
                    .ok()
            })
            .collect();
        clusters.sort();
        clusters.dedup();
        Ok(clusters)
    }
}
