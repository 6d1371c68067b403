use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusty_s3::actions::{CreateMultipartUpload, S3Action};
use rusty_s3::{Bucket, Credentials};
use tracing::{debug, error, info};

use cassbak_types::{Error, Result};

use crate::cancel::CancelToken;
use crate::digest::PartDigests;
use crate::paranoid;

use super::s3::{SSE_ALGORITHM, SSE_HEADER, STORAGE_CLASS_HEADER};
use super::PRESIGN_DURATION;

const MD5_HEADER: &str = "content-md5";
const SHA256_HEADER: &str = "x-amz-content-sha256";

/// Maximum concurrent part uploads per file.
const PART_WORKERS: usize = 4;

/// Uploads a file whose per-part hashes were computed up front, presenting
/// them to S3 so the store verifies every byte it accepts. Any part failure
/// aborts the whole multipart upload; a half-uploaded object never becomes
/// visible under its key.
pub(super) struct SafeUploader<'a> {
    pub bucket: &'a Bucket,
    pub credentials: &'a Credentials,
    pub agent: &'a ureq::Agent,
    pub storage_class: &'a str,
}

impl SafeUploader<'_> {
    pub fn upload_file(
        &self,
        cancel: &CancelToken,
        key: &str,
        file: &paranoid::File,
        digests: &PartDigests,
    ) -> Result<()> {
        // One verified handle for the whole upload; part readers are
        // independent offsets into it and it is closed exactly once.
        let os_file = file.open()?;

        if digests.parts() == 1 {
            return self.upload_single_part(key, &os_file, digests);
        }
        self.upload_multipart(cancel, key, &os_file, digests)
    }

    fn upload_single_part(
        &self,
        key: &str,
        os_file: &fs::File,
        digests: &PartDigests,
    ) -> Result<()> {
        let length = digests.part_length(1);
        let md5 = digests.part_content_md5(1);
        let sha256 = digests.part_content_sha256(1);

        let mut action = self.bucket.put_object(Some(self.credentials), key);
        action.headers_mut().insert(MD5_HEADER, &md5);
        action.headers_mut().insert(SHA256_HEADER, &sha256);
        action.headers_mut().insert(SSE_HEADER, SSE_ALGORITHM);
        action
            .headers_mut()
            .insert(STORAGE_CLASS_HEADER, self.storage_class);
        let url = action.sign(PRESIGN_DURATION);

        let reader = SectionReader::new(os_file, 0, length);
        self.agent
            .put(url.as_str())
            .set("Content-MD5", &md5)
            .set(SHA256_HEADER, &sha256)
            .set(SSE_HEADER, SSE_ALGORITHM)
            .set(STORAGE_CLASS_HEADER, self.storage_class)
            .set("Content-Length", &length.to_string())
            .send(reader)
            .map_err(|e| Error::Storage(format!("PUT {key}: {e}")))?;
        debug!(key, length, "single part upload complete");
        Ok(())
    }

    fn upload_multipart(
        &self,
        cancel: &CancelToken,
        key: &str,
        os_file: &fs::File,
        digests: &PartDigests,
    ) -> Result<()> {
        let parts = u16::try_from(digests.parts())
            .map_err(|_| Error::Other(format!("{key}: too many parts for multipart upload")))?;

        let mut create = self
            .bucket
            .create_multipart_upload(Some(self.credentials), key);
        create.headers_mut().insert(SSE_HEADER, SSE_ALGORITHM);
        create
            .headers_mut()
            .insert(STORAGE_CLASS_HEADER, self.storage_class);
        let url = create.sign(PRESIGN_DURATION);
        let body = self
            .agent
            .post(url.as_str())
            .set(SSE_HEADER, SSE_ALGORITHM)
            .set(STORAGE_CLASS_HEADER, self.storage_class)
            .call()
            .map_err(|e| Error::Storage(format!("CreateMultipartUpload {key}: {e}")))?
            .into_string()
            .map_err(|e| Error::Storage(format!("CreateMultipartUpload {key}: body: {e}")))?;
        let multipart = CreateMultipartUpload::parse_response(&body)
            .map_err(|e| Error::Storage(format!("CreateMultipartUpload {key}: parse: {e}")))?;
        let upload_id = multipart.upload_id();

        let etags: Mutex<BTreeMap<u16, String>> = Mutex::new(BTreeMap::new());
        let part_errors: Mutex<BTreeMap<u16, String>> = Mutex::new(BTreeMap::new());
        let abort = AtomicBool::new(false);

        std::thread::scope(|s| {
            let (part_tx, part_rx) = crossbeam_channel::unbounded::<u16>();
            for n in 1..=parts {
                part_tx.send(n).expect("unbounded channel send");
            }
            drop(part_tx);

            let workers = PART_WORKERS.min(parts as usize);
            for _ in 0..workers {
                let part_rx = part_rx.clone();
                let etags = &etags;
                let part_errors = &part_errors;
                let abort = &abort;
                s.spawn(move || {
                    for n in part_rx {
                        if abort.load(Ordering::SeqCst) || cancel.is_cancelled() {
                            return;
                        }
                        match self.upload_part(key, upload_id, n, os_file, digests) {
                            Ok(etag) => {
                                etags.lock().unwrap().insert(n, etag);
                            }
                            Err(e) => {
                                part_errors.lock().unwrap().insert(n, e.to_string());
                                abort.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                });
            }
        });

        let etags = etags.into_inner().unwrap();
        let mut part_errors = part_errors.into_inner().unwrap();
        if part_errors.is_empty() {
            if cancel.is_cancelled() {
                self.abort_multipart(key, upload_id);
                return Err(Error::Cancelled);
            }
            for n in 1..=parts {
                if !etags.contains_key(&n) {
                    part_errors.insert(n, "etag missing".to_string());
                }
            }
        }
        if !part_errors.is_empty() {
            self.abort_multipart(key, upload_id);
            return Err(Error::UploadPartFailures(
                part_errors.into_iter().collect(),
            ));
        }

        let action = self.bucket.complete_multipart_upload(
            Some(self.credentials),
            key,
            upload_id,
            etags.values().map(|etag| etag.as_str()),
        );
        let url = action.sign(PRESIGN_DURATION);
        let body = action.body();
        let resp = self
            .agent
            .post(url.as_str())
            .send_string(&body)
            .map_err(|e| Error::Storage(format!("CompleteMultipartUpload {key}: {e}")))?;
        let completion = resp
            .into_string()
            .map_err(|e| Error::Storage(format!("CompleteMultipartUpload {key}: body: {e}")))?;
        // S3 can return 200 with an error document in the body.
        if completion.contains("<Error>") {
            return Err(Error::Storage(format!(
                "CompleteMultipartUpload {key}: {completion}"
            )));
        }
        debug!(key, parts, "multipart upload complete");
        Ok(())
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        n: u16,
        os_file: &fs::File,
        digests: &PartDigests,
    ) -> Result<String> {
        let offset = digests.part_offset(n as u64);
        let length = digests.part_length(n as u64);
        let md5 = digests.part_content_md5(n as u64);
        let sha256 = digests.part_content_sha256(n as u64);

        let mut action = self
            .bucket
            .upload_part(Some(self.credentials), key, n, upload_id);
        action.headers_mut().insert(MD5_HEADER, &md5);
        action.headers_mut().insert(SHA256_HEADER, &sha256);
        let url = action.sign(PRESIGN_DURATION);

        let reader = SectionReader::new(os_file, offset, length);
        let resp = self
            .agent
            .put(url.as_str())
            .set("Content-MD5", &md5)
            .set(SHA256_HEADER, &sha256)
            .set("Content-Length", &length.to_string())
            .send(reader)
            .map_err(|e| Error::Storage(format!("UploadPart {key} #{n}: {e}")))?;

        match resp.header("etag") {
            Some(etag) => Ok(etag.to_string()),
            None => Err(Error::Storage(format!(
                "UploadPart {key} #{n}: response carried no etag"
            ))),
        }
    }

    fn abort_multipart(&self, key: &str, upload_id: &str) {
        let url = self
            .bucket
            .abort_multipart_upload(Some(self.credentials), key, upload_id)
            .sign(PRESIGN_DURATION);
        match self.agent.delete(url.as_str()).call() {
            Ok(_) => info!(key, "aborted multipart upload"),
            Err(e) => error!(key, error = %e, "failed to abort multipart upload"),
        }
    }
}

/// Positioned reads over a shared file handle, the equivalent of a section
/// reader: no seeking, so concurrent part readers never disturb each other.
struct SectionReader<'a> {
    file: &'a fs::File,
    offset: u64,
    remaining: u64,
}

impl<'a> SectionReader<'a> {
    fn new(file: &'a fs::File, offset: u64, length: u64) -> Self {
        SectionReader {
            file,
            offset,
            remaining: length,
        }
    }
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.file.read_at(&mut buf[..want], self.offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than expected during part upload",
            ));
        }
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}
