use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Operational CLI for the cadence recurring event engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run materialization for one organization or every enabled one
    Run(RunCommand),
    /// Prune instances past the retention window
    Prune(PruneCommand),
    /// Manage per-organization generation windows
    Window(WindowCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct RunCommand {
    /// Organization to materialize; omit to sweep all enabled organizations
    #[clap(short, long)]
    pub org: Option<Uuid>,
    /// Clock override for the run (RFC 3339); defaults to now
    #[clap(long)]
    pub at: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct PruneCommand {
    /// Organization to prune
    #[clap(short, long)]
    pub org: Uuid,
}

#[derive(Parser, Debug, Clone)]
pub struct WindowCommand {
    #[command(subcommand)]
    pub command: WindowSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum WindowSubcommand {
    /// Create a generation window for an organization (no-op if present)
    Init(WindowInitCommand),
    /// Show a window's ledger and retention status
    Status(WindowStatusCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct WindowInitCommand {
    /// Organization the window belongs to
    #[clap(short, long)]
    pub org: Uuid,
    /// Operator creating the window
    #[clap(long)]
    pub creator: Uuid,
    /// Months kept materialized ahead
    #[clap(long, default_value_t = 12)]
    pub hot_months: i32,
    /// Months of history kept before pruning
    #[clap(long, default_value_t = 12)]
    pub retention_months: i32,
    /// Run priority (1..=10, higher runs first)
    #[clap(long, default_value_t = 5)]
    pub priority: i32,
    /// Per-run instance cap (back-pressure)
    #[clap(long, default_value_t = 1000)]
    pub max_instances_per_run: i64,
    /// Operator notes
    #[clap(long)]
    pub notes: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct WindowStatusCommand {
    /// Organization to inspect
    #[clap(short, long)]
    pub org: Uuid,
}
