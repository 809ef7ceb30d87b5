use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use casket::config::{Compression, Config, Encryption};
use casket::repo::Repository;

#[derive(Parser)]
#[command(author, version, about = "Content-addressed backup engine")]
struct Cli {
    /// A global log level to use when printing logs. `RUST_LOG` takes
    /// priority, following `tracing_subscriber::filter::EnvFilter`.
    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initializes the local metadata store and records the repository
    /// configuration.
    Init {
        /// Remote storage location, e.g. `file:///srv/backups` or
        /// `s3://bucket/prefix`.
        #[arg(long, env = "CASKET_STORAGE_URL")]
        storage_url: Url,

        /// Compression applied to remote bytes at rest.
        #[arg(long, default_value = "zstd")]
        compression: Compression,

        /// Encryption applied to remote bytes at rest.
        #[arg(long, default_value = "none")]
        encryption: Encryption,

        /// Files strictly smaller than this many bytes are embedded
        /// directly in their inode object.
        #[arg(long)]
        inline_threshold: Option<u64>,

        /// Chunk size in bytes for large files.
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Number of concurrent backup workers.
        #[arg(long)]
        workers: Option<usize>,

        db: PathBuf,
    },

    /// Starts tracking a filesystem root.
    AddRoot {
        path: PathBuf,

        db: PathBuf,
    },

    /// Scans the tracked roots for changes.
    Scan {
        /// Only scan newly discovered entries. Useful right after adding
        /// a root.
        #[arg(long)]
        skip_existing: bool,

        db: PathBuf,
    },

    /// Backs up everything the last scan found changed, then records one
    /// snapshot per root.
    Backup {
        db: PathBuf,
    },

    /// Deletes objects no snapshot can reach anymore.
    Gc {
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = cli.log_level.unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), casket::Error> {
    match command {
        Commands::Init {
            storage_url,
            compression,
            encryption,
            inline_threshold,
            chunk_size,
            workers,
            db,
        } => {
            let mut config = Config::new(storage_url);
            config.compression = compression;
            config.encryption = encryption;
            if let Some(inline_threshold) = inline_threshold {
                config.inline_threshold = inline_threshold;
            }
            if let Some(chunk_size) = chunk_size {
                config.chunk_size = chunk_size;
            }
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            Repository::init(&db, config)?;
            Ok(())
        }

        Commands::AddRoot { path, db } => {
            let repo = Repository::open(&db)?;
            repo.add_root(&path)
        }

        Commands::Scan { skip_existing, db } => {
            let repo = Repository::open(&db)?;
            let stats = repo.scan(skip_existing, |_, _| {}).await?;
            info!(scanned = stats.scanned, "scan finished");
            Ok(())
        }

        Commands::Backup { db } => {
            let repo = Repository::open(&db)?;

            let cancel = CancellationToken::new();
            let cancel_on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight uploads");
                    cancel_on_interrupt.cancel();
                }
            });

            let stats = repo.backup(&cancel, |_, _| {}).await?;
            info!(
                entries = stats.entries,
                snapshots = stats.snapshots,
                "backup finished"
            );
            Ok(())
        }

        Commands::Gc { db } => {
            let repo = Repository::open(&db)?;
            let stats = repo.gc().await?;
            info!(
                objects = stats.objects,
                garbage = stats.garbage,
                "garbage collection finished"
            );
            Ok(())
        }
    }
}
