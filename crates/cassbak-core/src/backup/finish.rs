use crossbeam_channel::Receiver;
use tracing::{error, info};

use cassbak_types::{Error, Result};

use crate::bucket::{BucketClient, PutBlobOutcome};
use crate::cancel::CancelToken;
use crate::manifests::{Manifest, ManifestType, NodeIdentity};

use super::cleanup::CleanupHandler;
use super::FileRecord;

/// Drain uploaded records into the manifest, upload it, and report the
/// run's first error. Duplicate or missing manifest paths mean the pipeline
/// itself mis-routed a record; those are invariant violations surfaced as
/// fatal errors, not skipped files.
pub(super) fn run(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    identity: &NodeIdentity,
    mut manifest: Manifest,
    cleanup: &mut dyn CleanupHandler,
    uploaded_rx: Receiver<FileRecord>,
) -> Result<()> {
    let mut had_failures = false;
    let mut prospect_error: Option<Error> = None;
    let mut upload_error: Option<Error> = None;

    for record in uploaded_rx.iter() {
        let path = record_path(&record);
        if let Some(e) = record.prospect_error {
            cleanup.mark_prospect_failure();
            error!(path = %path, error = %e, "prospect error");
            had_failures = true;
            prospect_error.get_or_insert(e);
            continue;
        }
        match record.upload_outcome {
            Some(Err(e)) => {
                cleanup.mark_upload_failure();
                error!(path = %path, error = %e, "upload error");
                had_failures = true;
                upload_error.get_or_insert(e);
                continue;
            }
            Some(Ok(PutBlobOutcome::Uploaded)) | Some(Ok(PutBlobOutcome::Skipped)) => {}
            None => {
                return Err(Error::Other(
                    "pipeline record carried neither an outcome nor an error".into(),
                ));
            }
        }

        if record.manifest_path.is_empty() {
            // Only error sentinels may omit the path.
            return Err(Error::Other("empty manifest path on uploaded record".into()));
        }
        let (Some(file), Some(digests)) = (&record.file, &record.digests) else {
            return Err(Error::Other(
                "uploaded record is missing its file or digests".into(),
            ));
        };
        if manifest.data_files.contains_key(&record.manifest_path) {
            return Err(Error::Other(format!(
                "duplicate manifest path: {}",
                record.manifest_path
            )));
        }
        manifest
            .data_files
            .insert(record.manifest_path.clone(), digests.for_restore());
        cleanup.mark_upload_success(file);
    }

    if had_failures {
        // Still record what did make it up.
        manifest.manifest_type = ManifestType::Incomplete;
    }

    if !manifest.data_files.is_empty() {
        if manifest.manifest_type == ManifestType::Invalid {
            return Err(Error::Other("manifest type never assigned".into()));
        }
        match client.put_manifest(cancel, identity, &manifest) {
            Ok(()) => {
                info!(
                    manifest_type = %manifest.manifest_type,
                    files = manifest.data_files.len(),
                    "manifest uploaded"
                );
                cleanup.mark_manifest_upload_success();
            }
            Err(e) => {
                error!(error = %e, "manifest upload failed");
                cleanup.mark_manifest_upload_failure();
                return Err(e);
            }
        }
    } else {
        info!(reason = "no files", "not uploading manifest");
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if let Some(e) = upload_error {
        return Err(e);
    }
    if let Some(e) = prospect_error {
        return Err(e);
    }
    Ok(())
}

fn record_path(record: &FileRecord) -> String {
    record
        .file
        .as_ref()
        .map(|f| f.path().display().to_string())
        .unwrap_or_default()
}
