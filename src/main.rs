use std::process::ExitCode;

use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use pkgmerge::cli::{Cli, Command};
use pkgmerge::commands;
use pkgmerge::logging::Logger;

/// Exit code for fatal errors, outside the unmerge status bit range (0-15).
const EXIT_FATAL: u8 = 255;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let log = Logger::new(cli.verbose);

    let result = match cli.command {
        Command::Merge(args) => commands::merge::run(args, log).map(|()| 0),
        Command::Unmerge(args) => commands::unmerge::run(args, log),
    };

    match result {
        Ok(status) => ExitCode::from(status),
        Err(err) => {
            eprintln!("pkgmerge: fatal error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
