//! ditta CLI — business-record enrichment engine.
//!
//! Loads company records, schedules resolution jobs, and runs the worker
//! pool that resolves websites, VAT numbers, and financial data.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
