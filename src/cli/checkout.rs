//! Fetch and checkout command implementations.

use clap::Args;

use super::ConsoleProgress;
use crate::Result;

/// Arguments for the fetch command
#[derive(Args)]
pub struct FetchArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Version tag to fetch
    pub tag: String,
}

/// Run the fetch command
pub fn run_fetch(args: FetchArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;
    let report = repo.fetch(&args.tag, &ConsoleProgress)?;

    println!(
        "fetched [{}]: {} object(s), {} bytes",
        args.tag, report.downloaded, report.bytes
    );
    Ok(())
}

/// Arguments for the checkout command
#[derive(Args)]
pub struct CheckoutArgs {
    /// Entity type (datasets, models, labels)
    pub entity_type: String,

    /// Version tag, or an entity name resolved with --version
    pub target: String,

    /// Entity version to resolve when an entity name is given
    #[arg(long)]
    pub version: Option<usize>,

    /// Materialize only the first N files of the manifest
    #[arg(long)]
    pub sample: Option<usize>,
}

/// Run the checkout command
pub fn run_checkout(args: CheckoutArgs) -> Result<()> {
    let repo = super::open_repository(&args.entity_type)?;

    let tag = if crate::spec::TagRef::parse(&args.target).is_some() {
        args.target.clone()
    } else {
        repo.get_tag(&args.target, args.version)?
    };

    let report = repo.checkout(&tag, args.sample, &ConsoleProgress)?;
    println!("checked out [{}]: {} file(s)", tag, report.files);
    Ok(())
}
