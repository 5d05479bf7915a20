use crate::search::service::DEFAULT_LIMIT;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// docvec - Local semantic search over a directory of documents
#[derive(Parser, Debug)]
#[command(name = "docvec")]
#[command(about = "A local-first document indexing and semantic retrieval engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Custom base directory (default: $DOCVEC_HOME or ~/.docvec)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize docvec (create directories, write config and download model)
    Init,
    /// Index documents from a directory
    Index {
        /// Path to the corpus directory
        path: PathBuf,
        /// Re-embed every fragment, even unchanged ones
        #[arg(short, long)]
        force: bool,
    },
    /// Bring the index up to date with a directory
    Reindex {
        /// Path to the corpus directory
        path: PathBuf,
    },
    /// Search the index
    Search {
        /// Search query
        query: String,
        /// Maximum number of results to return
        #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index statistics
    Status,
    /// Watch a directory for changes and automatically update the index
    Watch {
        /// Path to the corpus directory
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_with_options() {
        let cli = Cli::parse_from([
            "docvec",
            "--base-dir",
            "/tmp/dv",
            "search",
            "branch protection",
            "-l",
            "3",
            "--json",
        ]);
        assert_eq!(cli.base_dir, Some(PathBuf::from("/tmp/dv")));
        match cli.command {
            Commands::Search { query, limit, json } => {
                assert_eq!(query, "branch protection");
                assert_eq!(limit, 3);
                assert!(json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_search_limit_defaults_to_five() {
        let cli = Cli::parse_from(["docvec", "search", "query"]);
        assert!(matches!(cli.command, Commands::Search { limit: 5, .. }));
    }

    #[test]
    fn test_base_dir_after_subcommand() {
        let cli = Cli::parse_from(["docvec", "index", "./docs", "--force", "--base-dir", "/x"]);
        assert_eq!(cli.base_dir, Some(PathBuf::from("/x")));
        assert!(matches!(cli.command, Commands::Index { force: true, .. }));
    }
}
