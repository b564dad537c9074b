use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::{ingestion::DEFAULT_BATCH_SIZE, search::DEFAULT_TOP_K, settings::Overrides};

#[derive(Debug, Parser)]
#[command(
    name = "threadsearch",
    about = "Semantic search and question answering over email threads"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Use this vector collection instead of the configured one
    #[arg(long, global = true)]
    pub collection: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            model: self.model.clone(),
            collection: self.collection.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk, embed and store emails from a JSON Lines file
    Ingest(IngestArgs),
    /// Search email excerpts by meaning
    Search(SearchArgs),
    /// Answer a question from the most relevant excerpts
    Ask(AskArgs),
    /// Show system status and statistics
    Status(StatusArgs),
    /// Inspect or clear the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Manage persistent settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// JSON Lines file with one email per line
    pub path: PathBuf,

    /// Chunks embedded per batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Search only within this thread
    #[arg(short = 't', long)]
    pub thread: Option<u64>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question
    pub query: String,

    /// Number of excerpts given to the language model
    #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Answer only from this thread
    #[arg(short = 't', long)]
    pub thread: Option<u64>,

    /// Also print the excerpts used
    #[arg(long)]
    pub sources: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Cache subcommands --

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show the number of cached queries
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop every cached result
    Clear,
    /// Drop the cached result of one search
    Forget {
        /// The query as it was searched
        query: String,

        /// The top_k the query was searched with
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        /// The thread filter the query was searched with
        #[arg(short = 't', long)]
        thread: Option<u64>,
    },
}

// -- Config subcommands --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the resolved settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in config.redb
    Set {
        /// Setting name
        key: String,
        /// New value
        value: String,
    },
    /// Remove a stored setting (revert to default)
    Unset {
        /// Setting name
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "threadsearch",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["threadsearch", "search", "budget?"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "budget?");
                assert_eq!(args.top_k, 5);
                assert_eq!(args.thread, None);
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_global_overrides() {
        let cli = Cli::parse_from([
            "threadsearch",
            "ask",
            "who approved it?",
            "-t",
            "42",
            "--collection",
            "archive",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.overrides().collection.as_deref(), Some("archive"));
        match cli.command {
            Command::Ask(args) => assert_eq!(args.thread, Some(42)),
            _ => panic!("expected ask command"),
        }
    }

    #[test]
    fn parse_cache_forget() {
        let cli = Cli::parse_from([
            "threadsearch",
            "cache",
            "forget",
            "budget?",
            "-k",
            "3",
        ]);
        match cli.command {
            Command::Cache {
                action:
                    CacheAction::Forget {
                        query,
                        top_k,
                        thread,
                    },
            } => {
                assert_eq!(query, "budget?");
                assert_eq!(top_k, 3);
                assert_eq!(thread, None);
            }
            _ => panic!("expected cache forget command"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["threadsearch", "-q", "-v", "status"]).is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }
}
