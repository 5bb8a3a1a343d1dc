//! # kbchat CLI
//!
//! The `kbchat` binary runs the HTTP server and exposes the same operations
//! on the command line for administration and local use.
//!
//! ## Usage
//!
//! ```bash
//! kbchat --config ./config/kbchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbchat init` | Create the chat-log database and the knowledge root |
//! | `kbchat serve` | Start the HTTP server |
//! | `kbchat ingest file <path> --user <id>` | Add a PDF or markdown file to a user's knowledge base |
//! | `kbchat ingest url <url> --user <id>` | Add a web page to a user's knowledge base |
//! | `kbchat ask "<question>" --user <id>` | Answer one chat turn |
//! | `kbchat history --user <id>` | Print a user's conversation |
//! | `kbchat clear --user <id>` | Clear a user's conversation |
//! | `kbchat prune --user <id> --keep <n>` | Keep only the newest turns |
//! | `kbchat sources --user <id>` | List the sources in a user's knowledge base |
//! | `kbchat token <id>` | Issue a session token for a user |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kbchat::config;
use kbchat::extract;
use kbchat::identity::SessionKeys;
use kbchat::ingest::{IngestOutcome, IngestSource};
use kbchat::logging;
use kbchat::migrate;
use kbchat::responder::Grounding;
use kbchat::server;
use kbchat::service::ChatService;
use kbchat_core::UserId;

/// kbchat — a multi-tenant retrieval-augmented chat backend.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbchat",
    about = "kbchat — a multi-tenant retrieval-augmented chat backend",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the chat-log schema and the knowledge root directory.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Add a document or web page to a user's knowledge base.
    Ingest {
        #[command(subcommand)]
        source: IngestCommand,
    },

    /// Answer one chat turn for a user.
    Ask {
        query: String,
        #[arg(long)]
        user: String,
    },

    /// Print a user's conversation, oldest first.
    History {
        #[arg(long)]
        user: String,
        /// Only the newest N turns.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete a user's conversation and seed the greeting turn.
    Clear {
        #[arg(long)]
        user: String,
    },

    /// Delete all but the newest turns of a user's conversation.
    Prune {
        #[arg(long)]
        user: String,
        #[arg(long)]
        keep: usize,
    },

    /// List the sources in a user's knowledge base.
    Sources {
        #[arg(long)]
        user: String,
    },

    /// Issue a session token (secret from `[server].session_secret_env`).
    Token { user: String },
}

#[derive(Subcommand)]
enum IngestCommand {
    /// A local PDF, markdown or text file.
    File {
        path: PathBuf,
        #[arg(long)]
        user: String,
    },
    /// A web page, fetched through the extraction provider.
    Url {
        url: String,
        #[arg(long)]
        user: String,
    },
}

fn parse_user(raw: &str) -> anyhow::Result<UserId> {
    Ok(UserId::parse(raw)?)
}

fn print_outcome(outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Ingested { source, chunks } => {
            println!("Ingested {} ({} chunks)", source, chunks)
        }
        IngestOutcome::NothingToIngest { source } => {
            println!("Nothing to ingest from {}", source)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_from_config(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.knowledge.root)?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Token { user } => {
            let keys = SessionKeys::from_env(&cfg.server.session_secret_env)?;
            println!("{}", keys.issue(&parse_user(&user)?));
        }
        Commands::Ingest { source } => {
            let service = ChatService::from_config(&cfg).await?;
            let (user, source) = match source {
                IngestCommand::File { path, user } => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string());
                    let content_type = extract::content_type_for(&name).ok_or_else(|| {
                        anyhow::anyhow!("Unsupported file type: {} (expected .pdf, .md or .txt)", name)
                    })?;
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    (user, IngestSource::document(&name, content_type, bytes)?)
                }
                IngestCommand::Url { url, user } => (user, IngestSource::Url(url)),
            };
            let outcome = service.ingest(&parse_user(&user)?, source).await?;
            print_outcome(&outcome);
        }
        Commands::Ask { query, user } => {
            let service = ChatService::from_config(&cfg).await?;
            let answer = service.respond(&parse_user(&user)?, &query).await?;
            println!("{}", answer.text);
            match &answer.grounding {
                Grounding::Grounded(sources) => println!("\nSources: {}", sources.join(", ")),
                Grounding::Ungrounded => println!("\n(no matching context in the knowledge base)"),
            }
        }
        Commands::History { user, limit } => {
            let service = ChatService::from_config(&cfg).await?;
            let user = parse_user(&user)?;
            let messages = match limit {
                Some(limit) => service.history().recent(&user, limit).await?,
                None => service.get_history(&user).await?,
            };
            if messages.is_empty() {
                println!("No messages.");
            }
            for m in messages {
                println!(
                    "[{}] {} {}: {}",
                    m.order,
                    m.created_at.format("%Y-%m-%d %H:%M:%S"),
                    m.sender.as_str(),
                    m.text
                );
            }
        }
        Commands::Clear { user } => {
            let service = ChatService::from_config(&cfg).await?;
            service.clear(&parse_user(&user)?).await?;
            println!("History cleared.");
        }
        Commands::Prune { user, keep } => {
            let service = ChatService::from_config(&cfg).await?;
            let deleted = service.history().prune(&parse_user(&user)?, keep).await?;
            println!("Deleted {} messages.", deleted);
        }
        Commands::Sources { user } => {
            let service = ChatService::from_config(&cfg).await?;
            let sources = service.sources(&parse_user(&user)?).await?;
            if sources.is_empty() {
                println!("No sources.");
            } else {
                println!("{:<60} {:>8}", "SOURCE", "CHUNKS");
                for s in sources {
                    println!("{:<60} {:>8}", s.source, s.chunks);
                }
            }
        }
    }

    Ok(())
}
