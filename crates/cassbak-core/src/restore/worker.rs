use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use cassbak_types::{Error, Result};

use crate::bucket::BucketClient;
use crate::cancel::CancelToken;
use crate::digest::{DigestCache, ForRestore};
use crate::paranoid;
use crate::writefile::TargetConfig;

/// Concurrent per-file restores.
const RESTORE_WORKERS: usize = 4;

pub struct RestoreWorker {
    client: Arc<dyn BucketClient>,
    digest_cache: DigestCache,
    target: TargetConfig,
}

impl RestoreWorker {
    pub fn new(client: Arc<dyn BucketClient>, digest_cache: DigestCache, target: TargetConfig) -> Self {
        RestoreWorker {
            client,
            digest_cache,
            target,
        }
    }

    /// Restore every file in the map, up to four at a time. Per-file
    /// failures are collected and reported together after all tasks end;
    /// cancellation stops the fan-out and wins over the aggregate.
    pub fn restore_files(
        &self,
        cancel: &CancelToken,
        files: &BTreeMap<String, ForRestore>,
    ) -> Result<()> {
        let file_errors: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());
        let (slot_tx, slot_rx) = bounded::<()>(RESTORE_WORKERS);

        std::thread::scope(|s| {
            for (name, digest) in files {
                if cancel.is_cancelled() {
                    break;
                }
                slot_tx.send(()).expect("semaphore channel closed");
                let slot_rx = slot_rx.clone();
                let file_errors = &file_errors;
                s.spawn(move || {
                    if let Err(e) = self.restore_file(cancel, name, digest) {
                        warn!(path = %name, error = %e, "restore file error");
                        file_errors
                            .lock()
                            .unwrap()
                            .push((name.clone(), e.to_string()));
                    }
                    let _ = slot_rx.recv();
                });
            }
        });

        cancel.check()?;
        let file_errors = file_errors.into_inner().unwrap();
        if file_errors.is_empty() {
            Ok(())
        } else {
            Err(Error::FileErrors(file_errors))
        }
    }

    fn restore_file(&self, cancel: &CancelToken, name: &str, digest: &ForRestore) -> Result<()> {
        let dest = self.target.directory.join(name);

        // Skip when the file already on disk carries the right content.
        if let Ok(existing) = paranoid::File::new(dest.clone()) {
            match self.digest_cache.get(cancel, &existing) {
                Ok(on_disk) if on_disk.for_restore() == *digest => {
                    debug!(path = name, size = existing.len(), "already on disk, skipping");
                    return Ok(());
                }
                Ok(_) => info!(path = name, "existing file has different digest"),
                Err(e) => info!(path = name, error = %e, "existing file digest failed"),
            }
        }

        let written = self.target.write_file(name, |file| {
            self.client.get_blob(cancel, digest, file)
        })?;

        // Fingerprint the fresh file while it is still hot in the page
        // cache, so the next backup run gets a digest-cache hit for free.
        if let Ok(fresh) = paranoid::File::new(written) {
            let _ = self.digest_cache.get(cancel, &fresh);
        }

        info!(path = name, "restored file");
        Ok(())
    }
}
