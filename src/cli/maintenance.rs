//! Fsck and gc command implementations.

use clap::Args;

use crate::Result;

/// Arguments for the fsck command
#[derive(Args)]
pub struct FsckArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name (used to reach the remote bucket for repairs)
    pub entity: String,
}

/// Run the fsck command
pub fn run_fsck(args: FsckArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let summary = repo.fsck(&args.entity)?;

    println!(
        "fsck: {} corrupted, {} repaired, {} cache issue(s)",
        summary.corrupted.len(),
        summary.repaired.len(),
        summary.cache_issues.len()
    );
    for cid in &summary.corrupted {
        println!("  corrupted: {}", cid);
    }
    Ok(())
}

/// Arguments for the gc command
#[derive(Args)]
pub struct GcArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,
}

/// Run the gc command
pub fn run_gc(args: GcArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let removed = repo.gc()?;

    println!("removed {} unreachable object(s)", removed);
    Ok(())
}
