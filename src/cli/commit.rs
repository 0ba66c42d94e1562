//! Commit command implementation.

use clap::Args;

use crate::Result;

/// Arguments for the commit command
#[derive(Args)]
pub struct CommitArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name
    pub entity: String,

    /// Commit message
    #[arg(short, long, default_value = "")]
    pub message: String,
}

/// Run the commit command
pub fn run(args: CommitArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let tag = repo.commit(&args.entity, &args.message)?;

    println!("committed [{}] as [{}]", args.entity, tag);
    Ok(())
}
