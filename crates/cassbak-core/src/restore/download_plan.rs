use std::collections::BTreeMap;

use crate::digest::ForRestore;

use super::plan::NodePlan;

/// Directory under which a cluster restore keeps superseded versions of
/// changed files, so nothing a manifest ever referenced is lost.
pub const PREVIOUS_VERSIONS_DIR: &str = "PREVIOUS_VERSIONS";

/// Per-host node plans merged into one flat download set, with file names
/// prefixed by the host they came from.
#[derive(Default)]
pub struct DownloadPlan {
    hosts: Vec<(String, NodePlan)>,
}

impl DownloadPlan {
    pub fn add_host(&mut self, hostname: &str, plan: NodePlan) {
        self.hosts.push((hostname.to_string(), plan));
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Flatten to `{host}/{name}` for final versions, plus
    /// `{host}/{prefix}/{name}/{index}` for every historical version of a
    /// changed file.
    pub fn include_changed(&self, prefix: &str) -> BTreeMap<String, ForRestore> {
        let mut files = BTreeMap::new();
        for (host, plan) in &self.hosts {
            for (name, digest) in &plan.files {
                files.insert(format!("{host}/{name}"), *digest);
            }
            for (name, history) in &plan.changed_files {
                for (index, entry) in history.iter().enumerate() {
                    files.insert(format!("{host}/{prefix}/{name}/{index}"), entry.digest);
                }
            }
        }
        files
    }
}
