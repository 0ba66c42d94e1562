//! Log command implementation.

use clap::Args;

use crate::Result;

/// Arguments for the log command
#[derive(Args)]
pub struct LogArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name
    pub entity: String,

    /// Include per-version file statistics
    #[arg(long)]
    pub fullstat: bool,
}

/// Run the log command
pub fn run(args: LogArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let entries = repo.log(&args.entity)?;

    for entry in entries {
        println!("tag: {}", entry.tag);
        println!("commit: {}", entry.commit);
        if !entry.message.is_empty() {
            println!("message: {}", entry.message);
        }
        if args.fullstat {
            for file in &entry.added_files {
                println!("  {}", file);
            }
            println!("added: {}", entry.added);
            println!("deleted: {}", entry.deleted);
            println!("files: {}", entry.total_files);
            println!("workspace size: {}", entry.workspace_size);
        }
        println!();
    }
    Ok(())
}
