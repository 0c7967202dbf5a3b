#![warn(missing_docs)]
//! fatposix image tool

use clap::Parser;
use fatposix::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    cli.run(&mut stdout)
}
