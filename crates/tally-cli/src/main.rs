//! tally: invoice attachment extraction with an audit trail.
//!
//! Configuration comes from the environment (and `.env` when present);
//! run `tally check-config` to see the resolved values.

mod app;
mod cli;
mod logging;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _guard = logging::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => app::run(args).await.map(|_| true),
        Commands::Schedule { now } => app::schedule(now).await.map(|_| true),
        Commands::Recent {
            days,
            status,
            limit,
        } => app::recent(days, status, limit).await.map(|_| true),
        Commands::Show { id } => app::show(id).await.map(|_| true),
        Commands::CheckConfig { ping } => app::check_config(ping).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
