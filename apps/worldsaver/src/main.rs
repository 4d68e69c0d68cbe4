use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use worldsaver_core::{RetentionPolicy, ServerKind};

mod archive;
mod backup;
mod commands;
mod config;
mod lock;
mod ownership;

#[derive(Parser)]
#[command(name = "worldsaver")]
#[command(about = "Consistent backups of running Minecraft servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Service configuration (YAML or JSON)
    #[arg(short, long, global = true, env = "WORLDSAVER_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides backupPath from the configuration
    #[arg(long, global = true, env = "WORLDSAVER_BACKUP_PATH")]
    backup_path: Option<PathBuf>,
    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,
    /// Trace logging, including raw console output
    #[arg(long, global = true)]
    trace: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backup pass and exit
    Backup {
        /// Only back up this container
        #[arg(long)]
        container: Option<String>,
    },
    /// Run the scheduled backup service
    Backupjob,
    /// Archive a world folder
    Pack {
        /// World folder
        world: PathBuf,
        /// Destination directory
        destination: PathBuf,
        /// Server flavor the world belongs to
        #[arg(short, long, value_enum, default_value = "bedrock")]
        kind: KindArg,
        /// Prefix the artifact with this container name, as scheduled backups do
        #[arg(long)]
        container: Option<String>,
    },
    /// Restore an archive into a folder
    Unpack {
        archive: PathBuf,
        destination: PathBuf,
    },
    /// Apply the retention policy to a backup directory
    Trim {
        /// Backup directory
        dir: PathBuf,
        #[arg(long, default_value_t = 3)]
        trim_days: u32,
        #[arg(long, default_value_t = 14)]
        keep_days: u32,
        #[arg(long, default_value_t = 1)]
        min_keep: usize,
        #[arg(long, default_value_t = 1)]
        keep_last: usize,
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Bedrock,
    Java,
}

impl From<KindArg> for ServerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Bedrock => ServerKind::Bedrock,
            KindArg::Java => ServerKind::Java,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.trace {
        "trace"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!(version = worldsaver_core::pkg_version(), "worldsaver starting");

    match cli.command {
        Commands::Backup { container } => {
            let setup = commands::Setup::load(cli.config.as_deref(), cli.backup_path)?;
            commands::backup::exec(setup, container).await?;
        }
        Commands::Backupjob => {
            let setup = commands::Setup::load(cli.config.as_deref(), cli.backup_path)?;
            commands::backupjob::exec(setup).await?;
        }
        Commands::Pack {
            world,
            destination,
            kind,
            container,
        } => {
            commands::pack::exec(world, destination, kind.into(), container).await?;
        }
        Commands::Unpack {
            archive,
            destination,
        } => {
            commands::unpack::exec(archive, destination).await?;
        }
        Commands::Trim {
            dir,
            trim_days,
            keep_days,
            min_keep,
            keep_last,
            dry_run,
        } => {
            let policy = RetentionPolicy {
                trim_days,
                keep_days,
                min_keep,
                keep_last,
            };
            commands::trim::exec(dir, policy, dry_run).await?;
        }
    }

    Ok(())
}
