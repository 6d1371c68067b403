use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::warn;

use cassbak_types::{Error, Result};

/// Where and how restored files land on disk: target directory, modes, and
/// (when running as root restoring a node) the owner to hand them to.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub directory: PathBuf,
    pub dir_mode: u32,
    pub file_mode: u32,
    pub owner: Option<(u32, u32)>,
}

impl TargetConfig {
    /// A node restore: files go into the live data directory owned by the
    /// cassandra user. The user must exist on a host running Cassandra.
    pub fn cassandra_node(directory: &Path) -> Result<Self> {
        let owner = lookup_user("cassandra")
            .ok_or_else(|| Error::Config("cassandra user not found on this host".into()))?;
        Ok(TargetConfig {
            directory: directory.to_path_buf(),
            dir_mode: 0o755,
            file_mode: 0o644,
            owner: Some(owner),
        })
    }

    /// A cluster download into a scratch directory: current user, no chown.
    pub fn plain(directory: &Path) -> Self {
        TargetConfig {
            directory: directory.to_path_buf(),
            dir_mode: 0o755,
            file_mode: 0o644,
            owner: None,
        }
    }

    /// Write a file at `name` under the target directory via a sibling temp
    /// file: `f` fills the handle, then the temp file takes its final mode
    /// and owner and is renamed into place. A failed write leaves nothing
    /// at the destination path.
    pub fn write_file(
        &self,
        name: &str,
        f: impl FnOnce(&mut fs::File) -> Result<()>,
    ) -> Result<PathBuf> {
        let dest = self.directory.join(name);
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Other(format!("no parent directory for {name}")))?;
        fs::create_dir_all(parent)?;
        self.apply_dir_ownership(parent);

        let mut temp = tempfile::Builder::new()
            .prefix(".cassbak-")
            .tempfile_in(parent)?;
        f(temp.as_file_mut())?;

        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(self.file_mode))?;
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::chown(temp.path(), Some(uid), Some(gid))?;
        }
        temp.persist(&dest)
            .map_err(|e| Error::Io(e.error))?;
        Ok(dest)
    }

    fn apply_dir_ownership(&self, dir: &Path) {
        if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(self.dir_mode)) {
            warn!(dir = %dir.display(), error = %e, "failed to set directory mode");
        }
        if let Some((uid, gid)) = self.owner {
            if let Err(e) = std::os::unix::fs::chown(dir, Some(uid), Some(gid)) {
                warn!(dir = %dir.display(), error = %e, "failed to chown directory");
            }
        }
    }
}

/// Resolve a system user to (uid, gid).
pub fn lookup_user(name: &str) -> Option<(u32, u32)> {
    let cname = CString::new(name).ok()?;
    // getpwnam is fine here: called once during startup, before any
    // threads that could also touch the passwd database exist.
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        None
    } else {
        unsafe { Some(((*pw).pw_uid, (*pw).pw_gid)) }
    }
}
