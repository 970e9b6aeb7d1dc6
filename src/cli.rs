use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "claude-usage-pulse",
    version,
    about = "Keep Claude Code usage totals fresh as session logs change"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the aggregation daemon. Changed file paths are read from stdin,
    /// one per line; change events are written to stdout as JSON lines.
    Run {
        /// Ignore stdin and rely on the periodic refresh only.
        #[arg(long)]
        no_stdin: bool,
    },
    /// Refresh once and print the aggregate.
    Status {
        /// Print the full aggregate as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check paths, configuration and lock state.
    Doctor,
    /// Parse one task received on stdin (spawned by the daemon).
    #[command(hide = true)]
    Worker,
}

impl Cli {
    pub fn command_or_default(self) -> Commands {
        self.command.unwrap_or(Commands::Run { no_stdin: false })
    }
}
