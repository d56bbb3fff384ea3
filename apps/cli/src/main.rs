//! Cachet CLI - command-line front end for the context cache service.
//!
//! Provides a `cachet` command that runs the cache lifecycle end to end
//! against an in-process service and inspects service configuration.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{config, walkthrough};

/// Cachet - context caching for LLM inference
///
/// Caches a large shared prompt prefix once and reuses it across generation
/// requests until it expires or is deleted.
#[derive(Parser, Debug)]
#[command(
    name = "cachet",
    author,
    version,
    about = "Cachet - context caching for LLM inference",
    long_about = "Cachet stores large, reused prompt prefixes (system instructions, documents, media) and binds\nthem ahead of per-request input, with TTL-based expiration and explicit deletion."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Directory holding .cachet/config.toml (defaults to the current directory)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full cache lifecycle against an in-process service
    ///
    /// Creates a cache from a system instruction and three research papers,
    /// asks a question, holds a two-turn chat, extends the TTL, deletes the
    /// cache, and shows that generation against it then fails.
    Walkthrough {
        /// Fixed model version to cache for
        #[arg(short, long, default_value = walkthrough::DEFAULT_MODEL)]
        model: String,

        /// Initial TTL in minutes
        #[arg(short, long, default_value_t = 60)]
        ttl_minutes: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect service configuration
    #[command(subcommand)]
    Config(config::ConfigCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    match args.command {
        Command::Walkthrough { model, ttl_minutes, json } => {
            walkthrough::execute(&root, &model, ttl_minutes, json).await
        }
        Command::Config(command) => config::execute(&root, command),
    }
}
