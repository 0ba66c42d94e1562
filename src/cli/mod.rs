//! Command-line interface for mlkeep.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cid::Cid;
use crate::repository::TransferProgress;

pub mod add;
pub mod checkout;
pub mod commit;
pub mod create;
pub mod init;
pub mod log;
pub mod maintenance;
pub mod push;
pub mod status;

/// mlkeep - versioning for large ML artifacts
#[derive(Parser)]
#[command(name = "mlkeep")]
#[command(about = "Version large ML artifacts with chunked, content-addressed storage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable debug output
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a repository in the current directory
    Init(init::InitArgs),
    /// Create a new entity workspace
    Create(create::CreateArgs),
    /// Stage workspace changes for an entity
    Add(add::AddArgs),
    /// Commit staged changes as a new version
    Commit(commit::CommitArgs),
    /// Upload objects and publish the version tag
    Push(push::PushArgs),
    /// Download the objects of a version
    Fetch(checkout::FetchArgs),
    /// Materialize a version in the workspace
    Checkout(checkout::CheckoutArgs),
    /// Show staged, deleted and untracked files
    Status(status::StatusArgs),
    /// Show version history
    Log(log::LogArgs),
    /// Verify object store integrity
    Fsck(maintenance::FsckArgs),
    /// Remove unreachable objects
    Gc(maintenance::GcArgs),
}

/// Builds the repository for the entity type named on the command line,
/// with configuration loaded from the current directory.
pub(crate) fn open_repository(entity_type: &str) -> crate::Result<crate::repository::LocalRepository> {
    let root = std::env::current_dir()?;
    let config = crate::config::Config::load(root)?;
    Ok(crate::repository::LocalRepository::new(
        config,
        entity_type.parse()?,
    ))
}

pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("mlkeep=debug")
    } else {
        EnvFilter::new("mlkeep=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Progress sink printing transfer milestones to the console.
pub struct ConsoleProgress;

impl TransferProgress for ConsoleProgress {
    fn on_object_done(&self, cid: &Cid, bytes: u64) {
        println!("  transferred {} ({} bytes)", cid, bytes);
    }

    fn on_complete(&self, objects: usize, bytes: u64) {
        println!("done: {} object(s), {} bytes", objects, bytes);
    }
}
