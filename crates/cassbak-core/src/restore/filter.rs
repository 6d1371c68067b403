use std::collections::HashSet;

use tracing::warn;

use cassbak_types::{Error, Result};

use super::plan::NodePlan;

/// Restricts a cluster restore to chosen tables, optionally dropping
/// secondary index directories (whose names start with a dot).
#[derive(Debug, Default)]
pub struct Filter {
    tables: HashSet<String>,
    pub include_indexes: bool,
}

impl Filter {
    /// `specs` are `keyspace.table` pairs as typed on the command line.
    pub fn build(specs: &[String], include_indexes: bool) -> Result<Self> {
        let mut tables = HashSet::with_capacity(specs.len());
        for spec in specs {
            if spec.split('.').count() != 2 {
                return Err(Error::Config(format!(
                    "invalid table '{spec}': expected keyspace.table"
                )));
            }
            tables.insert(spec.clone());
        }
        Ok(Filter {
            tables,
            include_indexes,
        })
    }

    /// A restore path matches when it has at least three segments, is not
    /// an excluded index component, and its `keyspace.table` (table
    /// directory stripped of its `-<id>` suffix) was requested.
    fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split('/').collect();
        if parts.len() < 3 {
            warn!(name, "unexpected restore path shape");
            return false;
        }
        if !self.include_indexes && parts[2].starts_with('.') {
            return false;
        }
        let Some(suffix_index) = parts[1].rfind('-') else {
            warn!(name, "table directory has no id suffix");
            return false;
        };
        let keyspace = parts[0];
        let table = &parts[1][..suffix_index];
        self.tables.contains(&format!("{keyspace}.{table}"))
    }

    pub fn apply(&self, plan: &mut NodePlan) {
        plan.files.retain(|name, _| self.matches(name));
        plan.changed_files.retain(|name, _| self.matches(name));
    }
}
