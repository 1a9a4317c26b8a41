//! Binary entry point for mengram's CLI.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::print_stderr)]

use clap::Parser;
use mengram::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mengram::cli::run(&cli)
}
