use std::sync::Arc;

use tracing::debug;

use cassbak_types::Result;

use crate::cache::{Cache, Lookup, Storage};
use crate::cancel::CancelToken;
use crate::config::Provider;
use crate::paranoid;

use super::ForUpload;

const CACHE_NAME: &str = "digests";

/// (file identity → digest-for-upload) over the persistent cache.
///
/// The key is the file's inode plus a provider tag byte; the value carries
/// the fingerprint header that [`paranoid::File::unwrap_cache_entry`]
/// validates, which is what makes inode reuse safe.
#[derive(Clone)]
pub struct DigestCache {
    cache: Cache,
    provider: Provider,
    part_size: u64,
}

impl DigestCache {
    pub fn new(storage: &Arc<Storage>, provider: Provider, part_size: u64) -> Self {
        DigestCache {
            cache: storage.cache(CACHE_NAME),
            provider,
            part_size,
        }
    }

    /// Return the digest bundle for `file`, computing and caching on miss.
    ///
    /// Concurrent callers may both compute the same file; the results are
    /// identical, so the last write winning needs no coordination.
    pub fn get(&self, cancel: &CancelToken, file: &paranoid::File) -> Result<ForUpload> {
        let key = self.cache_key(file);

        if let Some(hit) = self.cache.get(&key, |value| {
            let Some(raw) = file.unwrap_cache_entry(value) else {
                return Lookup::Reject;
            };
            match ForUpload::unmarshal(self.provider, raw) {
                Ok(digests) => Lookup::Accept(digests),
                Err(_) => Lookup::Reject,
            }
        }) {
            debug!(path = %file.path().display(), size = file.len(), "digest cache hit");
            return Ok(hit);
        }

        let digests = ForUpload::compute(cancel, file, self.provider, self.part_size)?;
        self.cache
            .put(&key, &file.wrap_cache_entry(&digests.marshal()));
        debug!(path = %file.path().display(), size = file.len(), "digest computed");
        Ok(digests)
    }

    fn cache_key(&self, file: &paranoid::File) -> [u8; paranoid::CACHE_KEY_LEN + 1] {
        let mut key = [0u8; paranoid::CACHE_KEY_LEN + 1];
        key[..paranoid::CACHE_KEY_LEN].copy_from_slice(&file.cache_key());
        key[paranoid::CACHE_KEY_LEN] = self.provider.cache_tag();
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Arc<Storage>, DigestCache) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("cache.db")).unwrap();
        let cache = DigestCache::new(&storage, Provider::Aws, 1024);
        (dir, storage, cache)
    }

    #[test]
    fn recompute_matches_cached_value() {
        let (dir, _storage, cache) = setup();
        let cancel = CancelToken::new();
        let path = dir.path().join("md-1-big-Data.db");
        fs::write(&path, b"cache this file").unwrap();
        let file = paranoid::File::new(path).unwrap();

        let first = cache.get(&cancel, &file).unwrap();
        let second = cache.get(&cancel, &file).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn modified_file_invalidates_entry() {
        let (dir, _storage, cache) = setup();
        let cancel = CancelToken::new();
        let path = dir.path().join("md-2-big-Data.db");
        fs::write(&path, b"first contents").unwrap();
        let file = paranoid::File::new(path.clone()).unwrap();
        let first = cache.get(&cancel, &file).unwrap();

        // Rewrite with different content and a different mtime; the stale
        // cache entry must fail header validation and be recomputed.
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&path, b"second, longer contents").unwrap();
        let rewritten = paranoid::File::new(path).unwrap();
        let second = cache.get(&cancel, &rewritten).unwrap();
        assert_ne!(first.for_restore(), second.for_restore());
    }

    #[test]
    fn providers_do_not_share_entries() {
        let (dir, storage, aws_cache) = setup();
        let gcs_cache = DigestCache::new(&storage, Provider::Google, 1024);
        let cancel = CancelToken::new();
        let path = dir.path().join("md-3-big-Data.db");
        fs::write(&path, b"provider isolation").unwrap();
        let file = paranoid::File::new(path).unwrap();

        let aws = aws_cache.get(&cancel, &file).unwrap();
        let gcs = gcs_cache.get(&cancel, &file).unwrap();
        assert!(matches!(aws, ForUpload::S3 { .. }));
        assert!(matches!(gcs, ForUpload::Gcs { .. }));
        // Both address the same blob.
        assert_eq!(aws.for_restore(), gcs.for_restore());
    }
}
