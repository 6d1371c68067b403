mod signal;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::error;

use cassbak_core::backup::{self, BackupContext, IncrementalOptions, DATA_DIR};
use cassbak_core::bucket::{self, BucketClient};
use cassbak_core::cache::Storage;
use cassbak_core::cancel::CancelToken;
use cassbak_core::config::{Config, Provider, DEFAULT_PART_SIZE, DEFAULT_S3_STORAGE_CLASS};
use cassbak_core::daemon;
use cassbak_core::digest::DigestCache;
use cassbak_core::manifests::NodeIdentity;
use cassbak_core::nodeidentity::{self, CASSANDRA_CONFIG_FILE};
use cassbak_core::restore::{self, ClusterRestoreOptions, HostRestoreOptions, RestoreContext};
use cassbak_types::{Error, Result, Seconds};

#[derive(Parser)]
#[command(
    name = "cassbak",
    version,
    about = "Content-addressed Cassandra SSTable backup and restore"
)]
struct Cli {
    /// Object store bucket holding blobs and manifests
    #[arg(long, global = true, default_value = "")]
    bucket: String,

    /// Prefix under which all keys are stored
    #[arg(long, global = true, default_value = "/")]
    key_prefix: String,

    /// S3 region (required for the aws provider)
    #[arg(long, global = true, env = "AWS_REGION")]
    s3_region: Option<String>,

    /// Storage class for uploaded blobs
    #[arg(long, global = true, default_value = DEFAULT_S3_STORAGE_CLASS)]
    s3_storage_class: String,

    /// Object store provider
    #[arg(long, global = true, value_enum, default_value = "aws")]
    cloud_provider: CloudProvider,

    /// Location of the local cache file
    #[arg(long, global = true, default_value = "")]
    cache_file: String,

    /// Verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CloudProvider {
    Aws,
    Google,
}

impl From<CloudProvider> for Provider {
    fn from(p: CloudProvider) -> Provider {
        match p {
            CloudProvider::Aws => Provider::Aws,
            CloudProvider::Google => Provider::Google,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Back up this node
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Restore from backups
    Restore {
        #[command(subcommand)]
        command: RestoreCommands,
    },
    /// Enumerate the bucket
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Take a cluster snapshot and upload it
    Snapshot {
        /// Override cluster name when storing backups
        #[arg(long)]
        cluster: Option<String>,
        /// Override hostname when storing backups
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Upload incremental backup directories
    Incremental {
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        /// Do not delete incremental files after a clean upload
        #[arg(long)]
        no_clean_incremental: bool,
        /// Log each incremental file that is (or would be) removed
        #[arg(long)]
        verbose_clean: bool,
    },
    /// Run as a foreground daemon: incremental every 5m, snapshot every 1h
    Run {
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        no_clean_incremental: bool,
        #[arg(long)]
        verbose_clean: bool,
    },
}

#[derive(Subcommand)]
enum RestoreCommands {
    /// Restore this node's data directory
    Host {
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        /// Prefix pattern for selecting the backup host
        #[arg(long)]
        hostname_pattern: Option<String>,
        /// Ignore manifests before this time (unix seconds)
        #[arg(long, default_value_t = 0)]
        not_before: i64,
        /// Ignore manifests after this time (unix seconds)
        #[arg(long, default_value_t = 0)]
        not_after: i64,
        /// Plan only, download nothing
        #[arg(long)]
        dry_run: bool,
        /// Restore even when files changed between manifests
        #[arg(long)]
        allow_changed: bool,
    },
    /// Download many hosts' backups under a target directory
    Cluster {
        /// A subdirectory is created under this for each host
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        cluster: String,
        /// Download hosts matching this prefix
        #[arg(long)]
        hostname_pattern: String,
        /// Tables to download (keyspace.table, repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,
        /// Skip secondary index directories
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        skip_indexes: bool,
        #[arg(long, default_value_t = 0)]
        not_before: i64,
        #[arg(long, default_value_t = 0)]
        not_after: i64,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ListCommands {
    /// List manifests for one host
    Manifests {
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        hostname: String,
        #[arg(long, default_value_t = 0)]
        not_before: i64,
        #[arg(long, default_value_t = 0)]
        not_after: i64,
    },
    /// List hosts with backups in a cluster
    Hosts {
        #[arg(long)]
        cluster: String,
    },
    /// List clusters with backups
    Clusters,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancelToken::new();
    signal::install(&cancel);

    match run(&cli, &cancel) {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            // Clean shutdown on SIGINT/SIGTERM.
        }
        Err(e) => {
            error!(error = %e, "fatal");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli, cancel: &CancelToken) -> Result<()> {
    if cli.bucket.is_empty() {
        return Err(Error::Config("--bucket is required".into()));
    }
    if cli.cache_file.is_empty() {
        return Err(Error::Config("--cache-file is required".into()));
    }

    let config = Config {
        provider: cli.cloud_provider.into(),
        bucket: cli.bucket.clone(),
        key_prefix: cli.key_prefix.clone(),
        s3_region: cli.s3_region.clone(),
        s3_storage_class: cli.s3_storage_class.clone(),
        cache_file: PathBuf::from(&cli.cache_file),
        part_size: DEFAULT_PART_SIZE,
    };
    config.validate()?;

    let storage = Storage::open(&config.cache_file)?;
    let client = bucket::open_client(&config, &storage)?;
    let digest_cache = DigestCache::new(&storage, config.provider, config.part_size);
    let cassandra_config = PathBuf::from(CASSANDRA_CONFIG_FILE);

    match &cli.command {
        Commands::Backup { command } => {
            let ctx = BackupContext {
                cancel: cancel.clone(),
                client,
                digest_cache,
                data_dir: PathBuf::from(DATA_DIR),
            };
            match command {
                BackupCommands::Snapshot { cluster, hostname } => {
                    let (identity, template) = nodeidentity::identity_and_template(
                        &cassandra_config,
                        cluster.as_deref(),
                        hostname.as_deref(),
                    )?;
                    backup::snapshot(&ctx, &identity, template)
                }
                BackupCommands::Incremental {
                    cluster,
                    hostname,
                    no_clean_incremental,
                    verbose_clean,
                } => {
                    let (identity, template) = nodeidentity::identity_and_template(
                        &cassandra_config,
                        cluster.as_deref(),
                        hostname.as_deref(),
                    )?;
                    backup::incremental(
                        &ctx,
                        &identity,
                        template,
                        IncrementalOptions {
                            clean: !no_clean_incremental,
                            verbose_clean: *verbose_clean,
                        },
                    )
                }
                BackupCommands::Run {
                    cluster,
                    hostname,
                    no_clean_incremental,
                    verbose_clean,
                } => daemon::run(
                    &ctx,
                    &cassandra_config,
                    cluster.as_deref(),
                    hostname.as_deref(),
                    IncrementalOptions {
                        clean: !no_clean_incremental,
                        verbose_clean: *verbose_clean,
                    },
                ),
            }
        }

        Commands::Restore { command } => {
            let ctx = RestoreContext {
                cancel: cancel.clone(),
                client,
                digest_cache,
                cassandra_config,
            };
            match command {
                RestoreCommands::Host {
                    cluster,
                    hostname,
                    hostname_pattern,
                    not_before,
                    not_after,
                    dry_run,
                    allow_changed,
                } => restore::restore_host(
                    &ctx,
                    &HostRestoreOptions {
                        cluster: cluster.clone(),
                        hostname: hostname.clone(),
                        hostname_pattern: hostname_pattern.clone(),
                        not_before: *not_before,
                        not_after: *not_after,
                        dry_run: *dry_run,
                        allow_changed: *allow_changed,
                        data_dir: PathBuf::from(DATA_DIR),
                    },
                ),
                RestoreCommands::Cluster {
                    target,
                    cluster,
                    hostname_pattern,
                    tables,
                    skip_indexes,
                    not_before,
                    not_after,
                    dry_run,
                } => restore::restore_cluster(
                    &ctx,
                    &ClusterRestoreOptions {
                        target: target.clone(),
                        cluster: cluster.clone(),
                        hostname_pattern: hostname_pattern.clone(),
                        tables: tables.clone(),
                        skip_indexes: *skip_indexes,
                        not_before: *not_before,
                        not_after: *not_after,
                        dry_run: *dry_run,
                    },
                ),
            }
        }

        Commands::List { command } => run_list(command, cancel, client.as_ref()),
    }
}

fn run_list(command: &ListCommands, cancel: &CancelToken, client: &dyn BucketClient) -> Result<()> {
    match command {
        ListCommands::Manifests {
            cluster,
            hostname,
            not_before,
            not_after,
        } => {
            let identity = NodeIdentity {
                cluster: cluster.clone(),
                hostname: hostname.clone(),
            };
            let keys =
                client.list_manifests(cancel, &identity, Seconds(*not_before), Seconds(*not_after))?;
            for key in keys {
                println!("{key}");
            }
            Ok(())
        }
        ListCommands::Hosts { cluster } => {
            for identity in client.list_host_names(cancel, cluster)? {
                println!("{identity}");
            }
            Ok(())
        }
        ListCommands::Clusters => {
            for cluster in client.list_clusters(cancel)? {
                println!("{cluster}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_incremental_backup_flags() {
        let cli = Cli::parse_from([
            "cassbak",
            "--bucket",
            "my-backups",
            "--cache-file",
            "/var/lib/cassbak/cache.db",
            "--s3-region",
            "us-east-1",
            "backup",
            "incremental",
            "--no-clean-incremental",
        ]);
        assert_eq!(cli.bucket, "my-backups");
        assert_eq!(cli.key_prefix, "/");
        let Commands::Backup {
            command: BackupCommands::Incremental {
                no_clean_incremental,
                verbose_clean,
                ..
            },
        } = cli.command
        else {
            panic!("wrong command parsed");
        };
        assert!(no_clean_incremental);
        assert!(!verbose_clean);
    }

    #[test]
    fn parses_cluster_restore_flags() {
        let cli = Cli::parse_from([
            "cassbak",
            "--bucket",
            "b",
            "--cache-file",
            "c",
            "--cloud-provider",
            "google",
            "restore",
            "cluster",
            "--target",
            "/tmp/out",
            "--cluster",
            "prod",
            "--hostname-pattern",
            "cass",
            "--table",
            "ks.t1",
            "--table",
            "ks.t2",
            "--skip-indexes",
            "false",
        ]);
        let Commands::Restore {
            command:
                RestoreCommands::Cluster {
                    tables,
                    skip_indexes,
                    ..
                },
        } = cli.command
        else {
            panic!("wrong command parsed");
        };
        assert_eq!(tables, vec!["ks.t1", "ks.t2"]);
        assert!(!skip_indexes);
    }
}
