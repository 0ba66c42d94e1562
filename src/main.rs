//! mlkeep - versioning for large ML artifacts
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use mlkeep::cli::{self, Cli, Commands};

fn main() {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Init(args) => cli::init::run(args),
        Commands::Create(args) => cli::create::run(args),
        Commands::Add(args) => cli::add::run(args),
        Commands::Commit(args) => cli::commit::run(args),
        Commands::Push(args) => cli::push::run(args),
        Commands::Fetch(args) => cli::checkout::run_fetch(args),
        Commands::Checkout(args) => cli::checkout::run_checkout(args),
        Commands::Status(args) => cli::status::run(args),
        Commands::Log(args) => cli::log::run(args),
        Commands::Fsck(args) => cli::maintenance::run_fsck(args),
        Commands::Gc(args) => cli::maintenance::run_gc(args),
    };

    if let Err(err) = result {
        eprintln!("error: {}", err);
        std::process::exit(err.exit_code());
    }
}
