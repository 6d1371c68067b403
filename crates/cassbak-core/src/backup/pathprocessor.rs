use std::collections::HashSet;

/// Maps a path relative to the data directory to its canonical restore
/// path, or the empty string when the file is not this backup's business.
pub trait PathProcessor: Send + Sync {
    fn manifest_path(&self, rel_path: &str) -> String;
}

/// `keyspace/table/backups/rest...` becomes `keyspace/table/rest...`; live
/// SSTables and snapshot contents are skipped.
#[derive(Default)]
pub struct IncrementalPathProcessor {
    /// Keyspaces to drop entirely. Development convenience only.
    pub ignore_keyspaces: HashSet<String>,
}

impl PathProcessor for IncrementalPathProcessor {
    fn manifest_path(&self, rel_path: &str) -> String {
        let parts: Vec<&str> = rel_path.split('/').collect();
        if parts.len() < 4 || parts[2] != "backups" {
            return String::new();
        }
        if self.ignore_keyspaces.contains(parts[0]) {
            return String::new();
        }
        let mut restore_parts = Vec::with_capacity(parts.len() - 1);
        restore_parts.extend_from_slice(&parts[0..2]);
        restore_parts.extend_from_slice(&parts[3..]);
        restore_parts.join("/")
    }
}

/// `keyspace/table/snapshots/{name}/rest...` becomes
/// `keyspace/table/rest...` for the one chosen snapshot name only.
pub struct SnapshotPathProcessor {
    pub name: String,
}

impl PathProcessor for SnapshotPathProcessor {
    fn manifest_path(&self, rel_path: &str) -> String {
        let parts: Vec<&str> = rel_path.split('/').collect();
        if parts.len() < 5 || parts[2] != "snapshots" || parts[3] != self.name {
            return String::new();
        }
        let mut restore_parts = Vec::with_capacity(parts.len() - 2);
        restore_parts.extend_from_slice(&parts[0..2]);
        restore_parts.extend_from_slice(&parts[4..]);
        restore_parts.join("/")
    }
}
