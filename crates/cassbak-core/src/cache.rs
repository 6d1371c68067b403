use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use tracing::{debug, warn};

use cassbak_types::{Error, Result, Seconds};

/// Width of one cache time window: 2^20 seconds, roughly 12 days.
pub const BUCKET_PERIOD: i64 = 1 << 20;

type ByteTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

/// The process-wide embedded cache store.
///
/// Entries live in per-window tables named `{window:020}/{cache}`. Reads
/// consult the current window, then the previous one; a previous-window hit
/// is promoted forward. Writing into a window that does not exist yet first
/// deletes every window other than current and previous, which bounds the
/// store without a background sweeper. redb holds an exclusive file lock,
/// so two processes cannot race on the same cache file.
pub struct Storage {
    db: Database,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)
            .map_err(|e| Error::Storage(format!("cache open {}: {e}", path.display())))?;
        ensure_file_ownership(path);
        Ok(Arc::new(Storage { db }))
    }

    pub fn cache(self: &Arc<Self>, name: &'static str) -> Cache {
        Cache {
            storage: Arc::clone(self),
            name,
        }
    }

    #[cfg(test)]
    fn put_in_window(&self, window: i64, cache: &str, key: &[u8], value: &[u8]) {
        let name = table_name(window, cache);
        let txn = self.db.begin_write().unwrap();
        {
            let def: ByteTable = TableDefinition::new(&name);
            let mut table = txn.open_table(def).unwrap();
            table.insert(key, value).unwrap();
        }
        txn.commit().unwrap();
    }

    #[cfg(test)]
    fn window_contains(&self, window: i64, cache: &str, key: &[u8]) -> bool {
        let name = table_name(window, cache);
        let txn = self.db.begin_read().unwrap();
        let def: ByteTable = TableDefinition::new(&name);
        match txn.open_table(def) {
            Ok(table) => table.get(key).unwrap().is_some(),
            Err(_) => false,
        }
    }

    #[cfg(test)]
    fn table_names(&self) -> Vec<String> {
        let txn = self.db.begin_read().unwrap();
        txn.list_tables()
            .unwrap()
            .map(|h| h.name().to_string())
            .collect()
    }
}

/// Outcome of inspecting a cached value: accept it, or reject it so the
/// entry is treated as a miss and never promoted.
pub enum Lookup<T> {
    Accept(T),
    Reject,
}

/// A named logical cache inside [`Storage`].
#[derive(Clone)]
pub struct Cache {
    storage: Arc<Storage>,
    name: &'static str,
}

impl Cache {
    /// Look up `key`, letting `f` validate and decode the raw value.
    ///
    /// Every internal failure degrades to a miss: the caller recomputes and
    /// overwrites, which is always safe for this store.
    pub fn get<T>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> Lookup<T>) -> Option<T> {
        match self.fetch(key) {
            Ok(Some((value, from_previous))) => match f(&value) {
                Lookup::Accept(decoded) => {
                    if from_previous {
                        debug!(cache = self.name, "promoting entry to current window");
                        self.put(key, &value);
                    }
                    Some(decoded)
                }
                Lookup::Reject => None,
            },
            Ok(None) => None,
            Err(e) => {
                debug!(cache = self.name, error = %e, "cache get failed, treating as miss");
                None
            }
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        if let Err(e) = self.try_put(key, value) {
            warn!(cache = self.name, error = %e, "cache put failed");
        }
    }

    fn fetch(&self, key: &[u8]) -> Result<Option<(Vec<u8>, bool)>> {
        let (current, previous) = current_and_previous_windows(Seconds::now().0);
        let txn = self
            .storage
            .db
            .begin_read()
            .map_err(|e| Error::Storage(e.to_string()))?;

        for (window, from_previous) in [(current, false), (previous, true)] {
            let name = table_name(window, self.name);
            let def: ByteTable = TableDefinition::new(&name);
            let table = match txn.open_table(def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(Error::Storage(e.to_string())),
            };
            if let Some(guard) = table
                .get(key)
                .map_err(|e| Error::Storage(e.to_string()))?
            {
                return Ok(Some((guard.value().to_vec(), from_previous)));
            }
        }
        Ok(None)
    }

    fn try_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let (current, previous) = current_and_previous_windows(Seconds::now().0);
        let txn = self
            .storage
            .db
            .begin_write()
            .map_err(|e| Error::Storage(e.to_string()))?;

        let existing: Vec<String> = txn
            .list_tables()
            .map_err(|e| Error::Storage(e.to_string()))?
            .map(|h| h.name().to_string())
            .collect();

        let current_prefix = window_prefix(current);
        let previous_prefix = window_prefix(previous);
        if !existing.iter().any(|n| n.starts_with(&current_prefix)) {
            // First write into a new window: drop everything older than the
            // previous window before the current one comes into existence.
            for stale in existing
                .iter()
                .filter(|n| !n.starts_with(&previous_prefix))
            {
                let def: ByteTable = TableDefinition::new(stale);
                txn.delete_table(def)
                    .map_err(|e| Error::Storage(e.to_string()))?;
                debug!(cache = self.name, table = %stale, "removed expired cache window");
            }
        }

        {
            let name = table_name(current, self.name);
            let def: ByteTable = TableDefinition::new(&name);
            let mut table = txn
                .open_table(def)
                .map_err(|e| Error::Storage(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

fn current_and_previous_windows(now: i64) -> (i64, i64) {
    let current = (now / BUCKET_PERIOD) * BUCKET_PERIOD;
    (current, current - BUCKET_PERIOD)
}

fn window_prefix(window: i64) -> String {
    format!("{window:020}/")
}

fn table_name(window: i64, cache: &str) -> String {
    format!("{window:020}/{cache}")
}

/// Keep the cache file owned by the owner of its directory. Without this, a
/// restore run as root would leave the cache unreadable for the unprivileged
/// user the daemon normally runs as. Best-effort only.
fn ensure_file_ownership(path: &Path) {
    if unsafe { libc::geteuid() } != 0 {
        return;
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return,
    };
    let (db_meta, parent_meta) = match (fs::metadata(path), fs::metadata(parent)) {
        (Ok(db), Ok(parent)) => (db, parent),
        (Err(e), _) | (_, Err(e)) => {
            warn!(path = %path.display(), error = %e, "cache ownership stat failed");
            return;
        }
    };
    if db_meta.uid() != parent_meta.uid() || db_meta.gid() != parent_meta.gid() {
        match std::os::unix::fs::chown(path, Some(parent_meta.uid()), Some(parent_meta.gid())) {
            Ok(()) => debug!(
                path = %path.display(),
                uid = parent_meta.uid(),
                gid = parent_meta.gid(),
                "realigned cache file ownership"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "cache chown failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("cache.db")).unwrap();
        (dir, storage)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, storage) = open_storage();
        let cache = storage.cache("digests");
        cache.put(b"key-1", b"value-1");

        let hit = cache.get(b"key-1", |v| Lookup::Accept(v.to_vec()));
        assert_eq!(hit.as_deref(), Some(&b"value-1"[..]));
        assert!(cache.get(b"missing", |v| Lookup::Accept(v.to_vec())).is_none());
    }

    #[test]
    fn rejected_values_are_misses() {
        let (_dir, storage) = open_storage();
        let cache = storage.cache("digests");
        cache.put(b"key", b"stale");
        let miss: Option<Vec<u8>> = cache.get(b"key", |_| Lookup::Reject);
        assert!(miss.is_none());
    }

    #[test]
    fn previous_window_hits_are_promoted() {
        let (_dir, storage) = open_storage();
        let cache = storage.cache("digests");
        let (current, previous) = current_and_previous_windows(Seconds::now().0);

        storage.put_in_window(previous, "digests", b"old-key", b"old-value");
        assert!(!storage.window_contains(current, "digests", b"old-key"));

        let hit = cache.get(b"old-key", |v| Lookup::Accept(v.to_vec()));
        assert_eq!(hit.as_deref(), Some(&b"old-value"[..]));

        // One read moved the entry into the current window.
        assert!(storage.window_contains(current, "digests", b"old-key"));
    }

    #[test]
    fn rejected_previous_entries_are_not_promoted() {
        let (_dir, storage) = open_storage();
        let cache = storage.cache("digests");
        let (current, previous) = current_and_previous_windows(Seconds::now().0);

        storage.put_in_window(previous, "digests", b"bad", b"stale");
        let miss: Option<()> = cache.get(b"bad", |_| Lookup::Reject);
        assert!(miss.is_none());
        assert!(!storage.window_contains(current, "digests", b"bad"));
    }

    #[test]
    fn creating_a_new_window_expires_old_ones() {
        let (_dir, storage) = open_storage();
        let cache = storage.cache("digests");
        let (current, previous) = current_and_previous_windows(Seconds::now().0);
        let ancient = previous - 3 * BUCKET_PERIOD;

        storage.put_in_window(ancient, "digests", b"fossil", b"bytes");
        storage.put_in_window(previous, "digests", b"kept", b"bytes");

        // First put into the (not yet existing) current window triggers GC.
        cache.put(b"fresh", b"bytes");

        let names = storage.table_names();
        assert!(names.iter().any(|n| n.starts_with(&window_prefix(current))));
        assert!(names.iter().any(|n| n.starts_with(&window_prefix(previous))));
        assert!(
            !names.iter().any(|n| n.starts_with(&window_prefix(ancient))),
            "ancient window survived GC: {names:?}"
        );
    }

    #[test]
    fn caches_are_namespaced() {
        let (_dir, storage) = open_storage();
        let digests = storage.cache("digests");
        let exists = storage.cache("bucket_exists");
        digests.put(b"shared-key", b"digest-value");
        let miss: Option<Vec<u8>> = exists.get(b"shared-key", |v| Lookup::Accept(v.to_vec()));
        assert!(miss.is_none());
    }

    #[test]
    fn window_math() {
        let (current, previous) = current_and_previous_windows(5 * BUCKET_PERIOD + 17);
        assert_eq!(current, 5 * BUCKET_PERIOD);
        assert_eq!(previous, 4 * BUCKET_PERIOD);
    }
}
