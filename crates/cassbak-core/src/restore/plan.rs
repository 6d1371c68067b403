use std::collections::BTreeMap;

use tracing::error;

use cassbak_types::{Result, Seconds};

use crate::bucket::{get_manifests, BucketClient};
use crate::cancel::CancelToken;
use crate::digest::ForRestore;
use crate::manifests::{Manifest, ManifestKey, ManifestType, NodeIdentity};

/// One sighting of a file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub manifest: ManifestKey,
    pub digest: ForRestore,
}

/// What a single node's restore would download.
///
/// `files` maps every restore path to its newest digest. `changed_files`
/// holds the full history of any file whose digest differed between two
/// consecutive manifests, including the entry before the first change for
/// context. A changed SSTable is a red flag: SSTables are immutable, so a
/// change means overlapping generation numbers or a restored-then-diverged
/// node, and the operator must opt in to restoring over it.
#[derive(Debug, Default)]
pub struct NodePlan {
    pub files: BTreeMap<String, ForRestore>,
    pub changed_files: BTreeMap<String, Vec<HistoryEntry>>,
    pub selected_manifests: Vec<ManifestKey>,
}

/// Build the plan for one node: the latest snapshot at or before `not_after`
/// plus every manifest after it.
pub fn create(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    identity: &NodeIdentity,
    start_after: Seconds,
    not_after: Seconds,
) -> Result<NodePlan> {
    let manifests = select_manifests(cancel, client, identity, start_after, not_after)
        .map_err(|e| {
            error!(identity = %identity, error = %e, "manifest selection failed");
            e
        })?;
    Ok(assemble(manifests))
}

fn select_manifests(
    cancel: &CancelToken,
    client: &dyn BucketClient,
    identity: &NodeIdentity,
    start_after: Seconds,
    not_after: Seconds,
) -> Result<Vec<Manifest>> {
    let mut keys = client.list_manifests(cancel, identity, start_after, not_after)?;

    // Latest snapshot wins; everything after it layers on top.
    if let Some(snapshot_index) = keys
        .iter()
        .rposition(|k| k.manifest_type == ManifestType::Snapshot)
    {
        keys.drain(..snapshot_index);
    }
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    get_manifests(client, cancel, identity, &keys)
}

fn assemble(manifests: Vec<Manifest>) -> NodePlan {
    let mut plan = NodePlan {
        selected_manifests: Vec::with_capacity(manifests.len()),
        ..NodePlan::default()
    };

    let mut histories: BTreeMap<String, Vec<HistoryEntry>> = BTreeMap::new();
    for manifest in manifests {
        let key = manifest.key();
        plan.selected_manifests.push(key);
        for (name, digest) in manifest.data_files {
            histories.entry(name).or_default().push(HistoryEntry {
                manifest: key,
                digest,
            });
        }
    }

    for (name, history) in histories {
        for i in 0..history.len() {
            plan.files.insert(name.clone(), history[i].digest);
            if i > 0 && history[i].digest != history[i - 1].digest {
                let changed = plan.changed_files.entry(name.clone()).or_default();
                if changed.is_empty() {
                    changed.push(history[i - 1].clone());
                }
                changed.push(history[i].clone());
            }
        }
    }
    plan
}
