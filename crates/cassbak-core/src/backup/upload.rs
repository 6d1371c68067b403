use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::bucket::{BucketClient, PutBlobOutcome};
use crate::cancel::CancelToken;

use super::FileRecord;

/// Concurrent uploads per node. Two keeps a node's outbound bandwidth and
/// compaction I/O from fighting each other.
const UPLOAD_WORKERS: usize = 2;

/// Pull prospected records, upload each under a small worker pool, and
/// push them on. The downstream channel closes only after every in-flight
/// upload has completed, which is what lets finish trust a drained channel.
pub(super) fn run(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    prospect_rx: Receiver<FileRecord>,
    upload_tx: Sender<FileRecord>,
) {
    let (slot_tx, slot_rx) = bounded::<()>(UPLOAD_WORKERS);

    std::thread::scope(|s| {
        for record in prospect_rx.iter() {
            slot_tx.send(()).expect("semaphore channel closed");
            let slot_rx = slot_rx.clone();
            let upload_tx = upload_tx.clone();
            s.spawn(move || {
                upload_one(cancel, client, record, &upload_tx);
                let _ = slot_rx.recv();
            });
        }
    });
    debug!("prospecting done, uploads drained");
}

fn upload_one(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    mut record: FileRecord,
    tx: &Sender<FileRecord>,
) {
    if record.prospect_error.is_none() {
        if let (Some(file), Some(digests)) = (&record.file, &record.digests) {
            let outcome = client.put_blob(cancel, file, digests);
            match &outcome {
                Ok(PutBlobOutcome::Uploaded) => {
                    debug!(path = %file.path().display(), size = file.len(), "upload done");
                }
                Ok(PutBlobOutcome::Skipped) => {
                    debug!(path = %file.path().display(), size = file.len(), "upload skipped");
                }
                Err(e) if e.is_cancelled() => {
                    info!(path = %file.path().display(), size = file.len(), "upload cancelled");
                }
                Err(e) => {
                    warn!(path = %file.path().display(), error = %e, "upload failed");
                }
            }
            record.upload_outcome = Some(outcome);
        }
    }
    let _ = tx.send(record);
}
