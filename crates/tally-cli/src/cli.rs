use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Offline-first bookkeeping records with remote sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Optional path to engine config JSON
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Remote base URL (overrides TALLY_REMOTE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub remote: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add or replace a record
    Add {
        /// Target collection
        collection: String,
        /// Record JSON, e.g. '{"id":"p1","name":"Widget"}'
        record: String,
    },
    /// Merge fields into an existing record
    Edit {
        /// Target collection
        collection: String,
        /// Record ID
        id: String,
        /// JSON object of fields to merge
        patch: String,
    },
    /// Remove a record
    #[command(alias = "rm")]
    Remove {
        /// Target collection
        collection: String,
        /// Record ID
        id: String,
    },
    /// List records of a collection
    List {
        /// Target collection
        collection: String,
        /// Number of records to show
        #[arg(short, long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue depth and sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push pending changes and pull remote changes
    Sync {
        /// Keep syncing until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// List quarantined mutations
    DeadLetters {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Put a dead letter back on the queue
    Requeue {
        /// Mutation ID
        id: String,
    },
    /// Drop a dead letter
    Discard {
        /// Mutation ID
        id: String,
    },
    /// List recently resolved last-write-wins conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wipe all local data
    Clear {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}
