//! Status command implementation.

use clap::Args;

use crate::Result;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name
    pub entity: String,
}

/// Run the status command
pub fn run(args: StatusArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let report = repo.status(&args.entity)?;

    if !report.staged.is_empty() {
        println!("staged:");
        for (path, cid) in &report.staged {
            println!("  {} -> {}", path, cid);
        }
    }
    if !report.deleted.is_empty() {
        println!("deleted:");
        for path in &report.deleted {
            println!("  {}", path);
        }
    }
    if !report.corrupted.is_empty() {
        println!("corrupted:");
        for path in &report.corrupted {
            println!("  {}", path);
        }
    }
    if !report.untracked.is_empty() {
        println!("untracked:");
        for path in &report.untracked {
            println!("  {}", path);
        }
    }
    if report.staged.is_empty()
        && report.deleted.is_empty()
        && report.corrupted.is_empty()
        && report.untracked.is_empty()
    {
        println!("nothing to report for [{}]", args.entity);
    }
    Ok(())
}
