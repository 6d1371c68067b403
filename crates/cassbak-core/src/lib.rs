pub mod backup;
pub mod bucket;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod daemon;
pub mod digest;
pub mod keystore;
pub mod manifests;
pub mod nodeidentity;
pub mod nodetool;
pub mod paranoid;
pub mod restore;
pub mod writefile;

#[cfg(test)]
pub(crate) mod testutil;

pub use cassbak_types::{Error, Result, Seconds};
