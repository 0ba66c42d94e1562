//! Create command implementation.

use clap::Args;

use crate::spec::Mutability;
use crate::{Error, Result};

/// Arguments for the create command
#[derive(Args)]
pub struct CreateArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Entity name
    pub entity: String,

    /// Category path component (repeatable)
    #[arg(long = "category", required = true)]
    pub categories: Vec<String>,

    /// Mutability policy (strict, flexible, mutable)
    #[arg(long, default_value = "strict")]
    pub mutability: String,

    /// Storage location, e.g. s3h://my-bucket
    #[arg(long)]
    pub storage: String,

    /// Initial version
    #[arg(long, default_value = "1")]
    pub version: usize,
}

/// Run the create command
pub fn run(args: CreateArgs) -> Result<()> {
    let mutability = match args.mutability.as_str() {
        "strict" => Mutability::Strict,
        "flexible" => Mutability::Flexible,
        "mutable" => Mutability::Mutable,
        other => {
            return Err(Error::Config {
                reason: format!("unknown mutability [{}]", other),
            })
        }
    };

    let repo = super::open_repository(&args.entity_type)?;
    let workspace = repo.create(
        &args.entity,
        args.categories,
        mutability,
        &args.storage,
        args.version,
    )?;

    println!("created entity workspace at {}", workspace.display());
    Ok(())
}
