use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use casegrid_lib::store::NodeStore;

mod cmd;
mod output;

/// casegrid - parameter-sweep orchestration for simulation cases
#[derive(Parser)]
#[command(name = "cgrid")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Workspace root (defaults to $CASEGRID_WORKSPACE or the current directory)
  #[arg(short, long, global = true)]
  workspace: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Create a workspace from a base case directory
  Init {
    /// Base case directory to seed the root node with
    case: PathBuf,
  },

  /// Expand a variation specification into the variant tree
  Expand {
    /// Path to the YAML variation specification
    spec: PathBuf,
  },

  /// Dispatch one operation across every eligible node
  Run {
    /// Operation name, e.g. blockMesh
    operation: String,

    /// Bounded worker count for sibling materialization
    #[arg(short, long)]
    parallelism: Option<usize>,
  },

  /// Hand terminal solver runs off for out-of-process execution
  Submit,

  /// Probe submitted runs for completion
  Probe,

  /// Show per-state node counts
  Status,

  /// Select nodes by predicates, e.g. 'cells>=100' 'state==ready'
  Query {
    /// Shorthand filters (key<op>value, or a bare key for existence)
    filters: Vec<String>,

    /// Include nodes matching at least one predicate instead of all
    #[arg(long)]
    loose: bool,

    /// Consider every sequence element instead of only the latest
    #[arg(long)]
    all_elements: bool,
  },

  /// Rebuild the human-browsable symlink view
  View,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();
  let root = cli.workspace.unwrap_or_else(NodeStore::default_root);

  match cli.command {
    Commands::Init { case } => cmd::cmd_init(&root, &case),
    Commands::Expand { spec } => cmd::cmd_expand(&root, &spec),
    Commands::Run { operation, parallelism } => cmd::cmd_run(&root, &operation, parallelism).await,
    Commands::Submit => cmd::cmd_submit(&root).await,
    Commands::Probe => cmd::cmd_probe(&root),
    Commands::Status => cmd::cmd_status(&root),
    Commands::Query {
      filters,
      loose,
      all_elements,
    } => cmd::cmd_query(&root, &filters, loose, all_elements),
    Commands::View => cmd::cmd_view(&root),
  }
}
