use std::sync::Arc;

use cassbak_types::Seconds;

use crate::cache::{Cache, Lookup, Storage};
use crate::digest::ForRestore;

const CACHE_NAME: &str = "bucket_exists";

/// Retention recorded for a blob must outlive "now" by at least this much
/// before a cached presence decision is trusted without a live HEAD.
pub const OBJECT_LOCK_SAFETY_MARGIN_SECS: i64 = 12 * 3600;

/// Local cache of "this blob is in the bucket and retention-locked until T".
///
/// A hit lets an upload be skipped without any request. A miss says
/// nothing: callers must confirm absence with a live HEAD.
#[derive(Clone)]
pub struct ExistsCache {
    cache: Cache,
}

impl ExistsCache {
    pub fn new(storage: &Arc<Storage>) -> Self {
        ExistsCache {
            cache: storage.cache(CACHE_NAME),
        }
    }

    pub fn get(&self, restore: &ForRestore) -> bool {
        self.get_at(restore, Seconds::now())
    }

    fn get_at(&self, restore: &ForRestore, now: Seconds) -> bool {
        self.cache
            .get(&restore.marshal(), |value| {
                match Seconds::from_be_bytes(value) {
                    Ok(retained_until)
                        if now.0 + OBJECT_LOCK_SAFETY_MARGIN_SECS < retained_until.0 =>
                    {
                        Lookup::Accept(())
                    }
                    // Expired or undecodable entries must not be promoted.
                    _ => Lookup::Reject,
                }
            })
            .is_some()
    }

    pub fn put(&self, restore: &ForRestore, retained_until: Seconds) {
        self.cache
            .put(&restore.marshal(), &retained_until.to_be_bytes());
    }
}
