//! Mailvault CLI
//!
//! Command-line tools for Mailvault archive maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display archive statistics
//! - `query` - Run a history request against the archive
//! - `prune` - Remove envelopes older than a retention window
//! - `import` - Load envelopes from a JSON file

mod commands;

use clap::{Parser, Subcommand};
use mailvault_server::{BackendKind, ServerConfig, MAX_QUERY_LIMIT};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Mailvault command-line archive tools.
#[derive(Parser)]
#[command(name = "mailvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the archive directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Storage backend (redb, sqlite)
    #[arg(global = true, short, long, default_value = "redb")]
    backend: BackendKind,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display archive statistics
    Inspect {
        /// Show per-topic counts
        #[arg(short, long)]
        topics: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a history request and print what it would deliver
    Query {
        /// Lower time bound (unix seconds, inclusive)
        #[arg(long, default_value = "0")]
        lower: u32,

        /// Upper time bound (unix seconds, inclusive; 0 means now)
        #[arg(long, default_value = "0")]
        upper: u32,

        /// Topic to match, as 8 hex digits (repeatable)
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Maximum envelopes to return (0 means the server maximum)
        #[arg(short, long, default_value = "0")]
        limit: u32,

        /// Resume from a cursor printed by a previous query (hex)
        #[arg(short, long)]
        cursor: Option<String>,

        /// Largest query limit accepted
        #[arg(long, default_value_t = MAX_QUERY_LIMIT)]
        max_query_limit: u32,

        /// Bundle size ceiling in bytes
        #[arg(long)]
        max_message_size: Option<u32>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove envelopes older than a retention window
    Prune {
        /// Retention window in days
        #[arg(short, long)]
        days: u32,

        /// Deletions committed per batch
        #[arg(long, default_value = "1000")]
        batch_size: usize,

        /// Dry run - only count what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Load envelopes from a JSON file
    Import {
        /// JSON file holding an array of envelopes
        file: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = |command: &str| -> Result<ServerConfig, String> {
        let path = cli
            .path
            .clone()
            .ok_or_else(|| format!("Archive path required for {command}"))?;
        Ok(ServerConfig::new(path).with_backend(cli.backend))
    };

    match cli.command {
        Commands::Inspect { topics, ref format } => {
            commands::inspect::run(&config("inspect")?, topics, format)?;
        }
        Commands::Query {
            lower,
            upper,
            ref topics,
            limit,
            ref cursor,
            max_query_limit,
            max_message_size,
            ref format,
        } => {
            let mut config = config("query")?.with_max_query_limit(max_query_limit);
            if let Some(size) = max_message_size {
                config = config.with_max_message_size(size);
            }
            let args = commands::query::QueryArgs {
                lower,
                upper,
                topics: topics.clone(),
                limit,
                cursor: cursor.clone(),
            };
            commands::query::run(config, &args, format)?;
        }
        Commands::Prune {
            days,
            batch_size,
            dry_run,
        } => {
            let config = config("prune")?
                .with_data_retention_days(days)
                .with_cleaner_batch_size(batch_size);
            commands::prune::run(&config, dry_run)?;
        }
        Commands::Import { ref file } => {
            commands::import::run(&config("import")?, file)?;
        }
        Commands::Version => {
            println!("Mailvault CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
