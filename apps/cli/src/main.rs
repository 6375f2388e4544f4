//! Licitai CLI: PNCP procurement lead pipeline.
//!
//! Collects public procurement notices, matches them against saved keyword
//! searches, classifies and enriches the matches, and exports leads.

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
