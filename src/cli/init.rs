//! Init command implementation.

use clap::Args;

use crate::config::Config;
use crate::spec::EntityType;
use crate::Result;

/// Arguments for the init command
#[derive(Args)]
pub struct InitArgs {
    /// Metadata remote for datasets
    #[arg(long)]
    pub datasets_remote: Option<String>,

    /// Metadata remote for models
    #[arg(long)]
    pub models_remote: Option<String>,

    /// Metadata remote for labels
    #[arg(long)]
    pub labels_remote: Option<String>,
}

/// Run the init command
pub fn run(args: InitArgs) -> Result<()> {
    let root = std::env::current_dir()?;
    let mut config = Config::load(&root)?;

    if let Some(remote) = args.datasets_remote {
        config.datasets.git = remote;
    }
    if let Some(remote) = args.models_remote {
        config.models.git = remote;
    }
    if let Some(remote) = args.labels_remote {
        config.labels.git = remote;
    }

    config.save()?;

    for entity_type in EntityType::ALL {
        let repo = crate::repository::LocalRepository::new(config.clone(), entity_type);
        repo.init()?;
    }

    println!("initialized repository at {}", config.base_path().display());
    Ok(())
}
