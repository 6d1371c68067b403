use std::process::Command;

use tracing::{error, info};

use cassbak_types::{Error, Result};

pub const NODETOOL: &str = "/usr/bin/nodetool";

/// Create a named snapshot on the local node.
pub fn take_snapshot(name: &str) -> Result<()> {
    run(&["-h", "localhost", "snapshot", "-t", name])?;
    info!(name, "created snapshot");
    Ok(())
}

/// Clear a named snapshot on the local node.
pub fn clear_snapshot(name: &str) -> Result<()> {
    run(&["-h", "localhost", "clearsnapshot", "-t", name])?;
    info!(name, "cleared snapshot");
    Ok(())
}

fn run(args: &[&str]) -> Result<()> {
    let output = Command::new(NODETOOL).args(args).output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(?args, %stdout, %stderr, "nodetool failed");
        return Err(Error::Other(format!(
            "nodetool {} failed with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(())
}
