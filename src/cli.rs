//! Command-line front end over [`crate::Memory`] (§4.14).
//!
//! A thin demonstration surface: every subcommand parses its arguments,
//! builds a [`Memory`] from configuration, dispatches to the one method
//! that does the work, and prints the result. No business logic lives
//! here - it belongs in the library (§1 "Out of scope").

// CLI output is the whole point of this module.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use crate::config::MemoryConfig;
use crate::Memory;
use clap::{Parser, Subcommand};

/// Mengram: a markdown-vault, knowledge-graph-backed memory service.
#[derive(Debug, Parser)]
#[command(name = "mengram", version, about)]
pub struct Cli {
    /// Tenant identifier. Every note lives under `<vault_path>/<user>/`.
    #[arg(long, global = true, env = "MENGRAM_USER", default_value = "default")]
    pub user: String,

    /// Print debug-level logs.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// One subcommand per public `Memory` operation.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Extracts structured memory from a free-text message and merges it
    /// into the tenant's vault.
    Remember {
        /// The text to remember.
        text: String,
    },
    /// Hybrid retrieval: prints the assembled natural-language context for
    /// a query.
    Recall {
        /// The query text.
        query: String,
        /// Number of vector matches to seed graph expansion from.
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Hybrid retrieval: prints one scored entity row per match.
    Search {
        /// The query text.
        query: String,
        /// Number of rows to return.
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Prints aggregate vault statistics for the tenant.
    Stats,
    /// Removes an entity's note.
    Delete {
        /// The entity's canonical name.
        name: String,
    },
}

/// Runs the parsed CLI invocation against a `Memory` built from
/// environment-overridden configuration.
///
/// # Errors
///
/// Returns an error if configuration is invalid, or if the dispatched
/// operation fails (LLM/embedding/vault error).
pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    crate::observability::init_logging(cli.verbose);
    let config = MemoryConfig::from_env();
    let memory = Memory::new(config)?;

    match &cli.command {
        Command::Remember { text } => {
            let stats = memory.add(text.as_str(), &cli.user)?;
            println!("created: {}", stats.created.join(", "));
            println!("updated: {}", stats.updated.join(", "));
        }
        Command::Recall { query, top_k } => {
            let brain_context = memory.search(query, &cli.user, *top_k)?;
            if let Some(row) = brain_context.first() {
                println!("{}", row.context);
            } else {
                println!("(no matches)");
            }
        }
        Command::Search { query, top_k } => {
            for row in memory.search(query, &cli.user, *top_k)? {
                println!(
                    "{} ({}) [score: {:.2}] - {} facts, {} relations",
                    row.memory.name,
                    row.memory.entity_type,
                    row.score,
                    row.memory.facts.len(),
                    row.memory.relations.len(),
                );
            }
        }
        Command::Stats => {
            let stats = memory.stats(&cli.user)?;
            println!("notes: {}", stats.total_notes);
            println!("knowledge entries: {}", stats.knowledge_entries);
            for (entity_type, count) in &stats.by_type {
                println!("  {entity_type}: {count}");
            }
        }
        Command::Delete { name } => {
            if memory.delete(name, &cli.user)? {
                println!("deleted {name}");
            } else {
                println!("{name} not found");
            }
        }
    }
    Ok(())
}
