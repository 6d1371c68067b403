use tracing::{error, info, warn};

use cassbak_types::Result;

use crate::nodetool;
use crate::paranoid;

/// Per-backup-kind policy for what happens after the pipeline drains. All
/// marking happens from the single finish task; `execute` always runs,
/// success or not.
pub trait CleanupHandler {
    fn mark_upload_success(&mut self, file: &paranoid::File);
    fn mark_upload_failure(&mut self);
    fn mark_prospect_failure(&mut self);
    fn mark_manifest_upload_success(&mut self);
    fn mark_manifest_upload_failure(&mut self);
    fn execute(&mut self) -> Result<()>;
}

/// Snapshots always clear their on-disk hard-link set, even after a failed
/// run; leaving it behind would pin disk space until the next run anyway.
pub struct SnapshotCleanup {
    pub name: String,
}

impl CleanupHandler for SnapshotCleanup {
    fn mark_upload_success(&mut self, _file: &paranoid::File) {}
    fn mark_upload_failure(&mut self) {}
    fn mark_prospect_failure(&mut self) {}
    fn mark_manifest_upload_success(&mut self) {}
    fn mark_manifest_upload_failure(&mut self) {}

    fn execute(&mut self) -> Result<()> {
        nodetool::clear_snapshot(&self.name)
    }
}

/// Incremental source files may be deleted after upload, but only when the
/// entire run was clean: the manifest is the only record of where those
/// bytes went, so any doubt means the files stay.
pub struct IncrementalCleanup {
    clean: bool,
    verbose: bool,
    uploaded: Vec<paranoid::File>,
    saw_prospect_failure: bool,
    saw_upload_failure: bool,
    saw_manifest_upload_failure: bool,
    manifest_upload_ok: bool,
}

impl IncrementalCleanup {
    pub fn new(clean: bool, verbose: bool) -> Self {
        IncrementalCleanup {
            clean,
            verbose,
            uploaded: Vec::new(),
            saw_prospect_failure: false,
            saw_upload_failure: false,
            saw_manifest_upload_failure: false,
            manifest_upload_ok: false,
        }
    }

    #[cfg(test)]
    pub fn uploaded_len(&self) -> usize {
        self.uploaded.len()
    }
}

impl CleanupHandler for IncrementalCleanup {
    fn mark_upload_success(&mut self, file: &paranoid::File) {
        self.uploaded.push(file.clone());
    }

    fn mark_upload_failure(&mut self) {
        self.saw_upload_failure = true;
    }

    fn mark_prospect_failure(&mut self) {
        self.saw_prospect_failure = true;
    }

    fn mark_manifest_upload_success(&mut self) {
        self.manifest_upload_ok = true;
    }

    fn mark_manifest_upload_failure(&mut self) {
        self.saw_manifest_upload_failure = true;
    }

    fn execute(&mut self) -> Result<()> {
        if self.saw_prospect_failure {
            info!(reason = "prospect failure", "skipping incremental cleanup");
            return Ok(());
        }
        if self.saw_upload_failure {
            info!(reason = "upload failure", "skipping incremental cleanup");
            return Ok(());
        }
        if self.saw_manifest_upload_failure {
            info!(reason = "manifest upload failure", "skipping incremental cleanup");
            return Ok(());
        }
        if !self.manifest_upload_ok {
            info!(reason = "manifest not uploaded", "skipping incremental cleanup");
            return Ok(());
        }
        if !self.clean {
            info!(
                reason = "not enabled",
                would_remove = self.uploaded.len(),
                "skipping incremental cleanup"
            );
            if self.verbose {
                for file in &self.uploaded {
                    info!(path = %file.path().display(), "cleanup would have removed file");
                }
            }
            return Ok(());
        }

        let mut last_err = None;
        for file in &self.uploaded {
            match file.delete() {
                Ok(()) => {
                    if self.verbose {
                        info!(path = %file.path().display(), "cleanup removed file");
                    }
                }
                Err(e) if e.is_fingerprint_mismatch() => {
                    // Someone rewrote the source after we uploaded it; the
                    // new content has not been backed up, so leave it.
                    warn!(path = %file.path().display(), error = %e, "cleanup left modified file");
                    last_err = Some(e);
                }
                Err(e) => {
                    error!(path = %file.path().display(), error = %e, "cleanup failed to remove file");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
