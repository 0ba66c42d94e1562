//! Push command implementation.

use clap::Args;

use super::ConsoleProgress;
use crate::Result;

/// Arguments for the push command
#[derive(Args)]
pub struct PushArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name
    pub entity: String,
}

/// Run the push command
pub fn run(args: PushArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let report = repo.push(&args.entity, &ConsoleProgress)?;

    println!(
        "pushed [{}]: {} uploaded, {} already present",
        args.entity, report.uploaded, report.already_present
    );
    Ok(())
}
