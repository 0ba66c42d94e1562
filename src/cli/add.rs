//! Add command implementation.

use clap::Args;

use crate::Result;

/// Arguments for the add command
#[derive(Args)]
pub struct AddArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name
    pub entity: String,

    /// Increment the spec version before staging
    #[arg(long)]
    pub bump_version: bool,
}

/// Run the add command
pub fn run(args: AddArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let report = repo.add(&args.entity, args.bump_version)?;

    println!(
        "staged {} file(s), {} unchanged, {} deleted",
        report.staged, report.unchanged, report.deleted
    );
    Ok(())
}
