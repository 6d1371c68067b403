use std::path::Path;

use crossbeam_channel::Sender;
use tracing::{debug, error};

use cassbak_types::{Error, Result};

use crate::cancel::CancelToken;
use crate::digest::DigestCache;
use crate::paranoid;

use super::pathprocessor::PathProcessor;
use super::FileRecord;

/// Extensions a live SSTable component can have. A live file vanishing
/// mid-walk is normal rotation; the same thing under `backups/` or
/// `snapshots/` is a real problem, because those are the files being
/// backed up.
const LIVE_SSTABLE_EXTENSIONS: [&str; 4] = ["txt", "db", "crc32", "sha1"];

/// Walk the data directory, fingerprint and digest every file the path
/// processor claims, and stream the records downstream. On any failure a
/// sentinel record carrying the error is pushed so finish hears about it
/// in order.
pub(super) fn run(
    cancel: &CancelToken,
    digest_cache: &DigestCache,
    data_dir: &Path,
    processor: &dyn PathProcessor,
    tx: Sender<FileRecord>,
) {
    let entries = match collect_files(data_dir, processor) {
        Ok(entries) => entries,
        Err(e) => {
            let _ = tx.send(FileRecord::prospect_sentinel(e));
            return;
        }
    };
    debug!(count = entries.len(), "prospecting done");

    for (manifest_path, file) in entries {
        if cancel.is_cancelled() {
            let _ = tx.send(FileRecord::prospect_sentinel(Error::Cancelled));
            return;
        }

        let mut record = FileRecord {
            manifest_path,
            file: None,
            digests: None,
            prospect_error: None,
            upload_outcome: None,
        };
        match digest_cache.get(cancel, &file) {
            Ok(digests) => record.digests = Some(digests),
            Err(e) => record.prospect_error = Some(e),
        }
        record.file = Some(file);

        if tx.send(record).is_err() {
            // Downstream is gone; nothing left to report to.
            return;
        }
    }
}

fn collect_files(
    data_dir: &Path,
    processor: &dyn PathProcessor,
) -> Result<Vec<(String, paranoid::File)>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(data_dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(walk_err) => {
                if is_ignorable_walk_error(data_dir, &walk_err) {
                    debug!(error = %walk_err, "ignoring walk error");
                    continue;
                }
                error!(error = %walk_err, "walk error");
                return Err(walk_error(walk_err));
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(walk_err) => {
                if is_ignorable_walk_error(data_dir, &walk_err) {
                    debug!(error = %walk_err, "ignoring stat error");
                    continue;
                }
                error!(error = %walk_err, "stat error");
                return Err(walk_error(walk_err));
            }
        };

        let rel = entry
            .path()
            .strip_prefix(data_dir)
            .map_err(|e| Error::Other(format!("walk escaped data dir: {e}")))?
            .to_string_lossy()
            .to_string();
        let manifest_path = processor.manifest_path(&rel);
        if manifest_path.is_empty() {
            continue;
        }
        out.push((
            manifest_path,
            paranoid::File::from_metadata(entry.path().to_path_buf(), &meta),
        ));
    }
    Ok(out)
}

fn walk_error(err: walkdir::Error) -> Error {
    let text = err.to_string();
    match err.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Other(text),
    }
}

fn is_ignorable_walk_error(data_dir: &Path, err: &walkdir::Error) -> bool {
    let not_found = err
        .io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
    if !not_found {
        return false;
    }
    let Some(path) = err.path() else {
        return false;
    };
    let Ok(rel) = path.strip_prefix(data_dir) else {
        return false;
    };
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    let has_live_extension = |name: &str| {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| LIVE_SSTABLE_EXTENSIONS.contains(&ext))
    };

    match parts.len() {
        // keyspace/table/component: a live sstable rotating away mid-scan.
        3 => has_live_extension(&parts[2]),
        4 => {
            if parts[2] == "backups" || parts[2] == "snapshots" {
                return false;
            }
            // keyspace/table/<name>_index/component: a live 3.x index.
            parts[2].ends_with("_index") && has_live_extension(&parts[3])
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::pathprocessor::IncrementalPathProcessor;
    use std::fs;

    fn io_not_found_walk_err(dir: &Path, rel: &str) -> walkdir::Error {
        // walkdir only constructs its own errors, so trigger a real one by
        // walking a path that does not exist.
        let missing = dir.join(rel);
        walkdir::WalkDir::new(missing)
            .into_iter()
            .next()
            .unwrap()
            .unwrap_err()
    }

    #[test]
    fn live_sstable_not_found_is_ignorable() {
        let dir = tempfile::tempdir().unwrap();
        let err = io_not_found_walk_err(dir.path(), "ks/table-1/md-5-big-Data.db");
        assert!(is_ignorable_walk_error(dir.path(), &err));

        let err = io_not_found_walk_err(dir.path(), "ks/table-1/md-5-big-Statistics.txt");
        assert!(is_ignorable_walk_error(dir.path(), &err));
    }

    #[test]
    fn backup_and_snapshot_files_are_never_ignorable() {
        let dir = tempfile::tempdir().unwrap();
        let err = io_not_found_walk_err(dir.path(), "ks/table-1/backups/md-5-big-Data.db");
        assert!(!is_ignorable_walk_error(dir.path(), &err));

        let err = io_not_found_walk_err(dir.path(), "ks/table-1/snapshots/md-5-big-Data.db");
        assert!(!is_ignorable_walk_error(dir.path(), &err));
    }

    #[test]
    fn live_index_components_are_ignorable() {
        let dir = tempfile::tempdir().unwrap();
        let err = io_not_found_walk_err(dir.path(), "ks/table-1/.x_index/md-5-big-Data.db");
        assert!(is_ignorable_walk_error(dir.path(), &err));

        let err = io_not_found_walk_err(dir.path(), "ks/table-1/subdir/md-5-big-Data.db");
        assert!(!is_ignorable_walk_error(dir.path(), &err));
    }

    #[test]
    fn unknown_extensions_are_not_ignorable() {
        let dir = tempfile::tempdir().unwrap();
        let err = io_not_found_walk_err(dir.path(), "ks/table-1/md-5-big-Data.exotic");
        assert!(!is_ignorable_walk_error(dir.path(), &err));
    }

    #[test]
    fn collect_files_applies_the_path_processor() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("ks1/table-a1/backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("md-1-big-Data.db"), b"incremental").unwrap();
        fs::write(dir.path().join("ks1/table-a1/md-9-big-Data.db"), b"live").unwrap();

        let processor = IncrementalPathProcessor::default();
        let entries = collect_files(dir.path(), &processor).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "ks1/table-a1/md-1-big-Data.db");
        assert!(entries[0].1.path().ends_with("backups/md-1-big-Data.db"));
    }
}
