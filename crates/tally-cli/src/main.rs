//! Tally CLI - offline-first bookkeeping records from the terminal
//!
//! Every command works against the local store; `sync` talks to the remote.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::clear::run_clear;
use crate::commands::common::Context;
use crate::commands::conflicts::run_conflicts;
use crate::commands::dead_letters::{run_dead_letters, run_discard, run_requeue};
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::remove::run_remove;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive = "tally=info"
        .parse()
        .map_err(|error| CliError::Config(format!("invalid log directive: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let context = Context::resolve(cli.db, cli.config, cli.remote)?;

    match cli.command {
        Commands::Add { collection, record } => run_add(&collection, &record, &context).await?,
        Commands::Edit {
            collection,
            id,
            patch,
        } => run_edit(&collection, &id, &patch, &context).await?,
        Commands::Remove { collection, id } => run_remove(&collection, &id, &context).await?,
        Commands::List {
            collection,
            limit,
            json,
        } => run_list(&collection, limit, json, &context).await?,
        Commands::Status { json } => run_status(json, &context).await?,
        Commands::Sync { watch } => run_sync(watch, &context).await?,
        Commands::DeadLetters { json } => run_dead_letters(json, &context).await?,
        Commands::Requeue { id } => run_requeue(&id, &context).await?,
        Commands::Discard { id } => run_discard(&id, &context).await?,
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, &context).await?,
        Commands::Clear { yes } => run_clear(yes, &context).await?,
    }

    Ok(())
}
