use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{error, info};

use cassbak_types::Result;

use crate::backup::{self, BackupContext, IncrementalOptions};
use crate::nodeidentity;

pub const SNAPSHOT_EVERY: Duration = Duration::from_secs(60 * 60);
pub const INCREMENTAL_EVERY: Duration = Duration::from_secs(5 * 60);

const TICK: Duration = Duration::from_secs(60);

/// Foreground daemon: once a minute, run an incremental backup if one is
/// due, otherwise a snapshot if one is due. Incrementals get priority so
/// the hourly snapshot never starves the five-minute cadence. Backup
/// failures are logged and the loop keeps going; only cancellation ends it.
pub fn run(
    ctx: &BackupContext,
    cassandra_config: &Path,
    override_cluster: Option<&str>,
    override_hostname: Option<&str>,
    incremental_opts: IncrementalOptions,
) -> Result<()> {
    let mut last_incremental: Option<Instant> = None;
    let mut last_snapshot: Option<Instant> = None;

    loop {
        sleep_tick(ctx)?;

        let now = Instant::now();
        if due(last_incremental, now, INCREMENTAL_EVERY) {
            info!("starting scheduled incremental backup");
            match run_incremental(ctx, cassandra_config, override_cluster, override_hostname, incremental_opts) {
                Ok(()) => info!("scheduled incremental backup done"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => error!(error = %e, "scheduled incremental backup failed"),
            }
            last_incremental = Some(now);
        } else if due(last_snapshot, now, SNAPSHOT_EVERY) {
            info!("starting scheduled snapshot backup");
            match run_snapshot(ctx, cassandra_config, override_cluster, override_hostname) {
                Ok(()) => info!("scheduled snapshot backup done"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => error!(error = %e, "scheduled snapshot backup failed"),
            }
            last_snapshot = Some(now);
        }
    }
}

fn run_incremental(
    ctx: &BackupContext,
    cassandra_config: &Path,
    override_cluster: Option<&str>,
    override_hostname: Option<&str>,
    opts: IncrementalOptions,
) -> Result<()> {
    let (identity, template) =
        nodeidentity::identity_and_template(cassandra_config, override_cluster, override_hostname)?;
    backup::incremental(ctx, &identity, template, opts)
}

fn run_snapshot(
    ctx: &BackupContext,
    cassandra_config: &Path,
    override_cluster: Option<&str>,
    override_hostname: Option<&str>,
) -> Result<()> {
    let (identity, template) =
        nodeidentity::identity_and_template(cassandra_config, override_cluster, override_hostname)?;
    backup::snapshot(ctx, &identity, template)
}

/// Whether an action whose last run was `last` is due again at `now`.
fn due(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now.duration_since(last) >= every,
    }
}

/// Sleep one tick in one-second slices so cancellation is noticed quickly.
fn sleep_tick(ctx: &BackupContext) -> Result<()> {
    let deadline = Instant::now() + TICK;
    while Instant::now() < deadline {
        ctx.cancel.check()?;
        std::thread::sleep(Duration::from_secs(1));
    }
    ctx.cancel.check()
}
