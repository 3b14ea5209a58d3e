//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use verigate_core::types::VerificationPolicy;

#[derive(Parser)]
#[command(name = "verigate", about = "verifier session controller", version)]
pub struct Cli {
    /// UDS socket path (default: $XDG_RUNTIME_DIR/verigate/verigated.sock)
    #[arg(long, short = 's', global = true, env = "VERIGATE_SOCKET")]
    pub socket_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon (controller + UDS server)
    Daemon(DaemonOpts),
    /// Show bound verifiers and live sessions
    Status(StatusOpts),
    /// Manage local experiments
    #[command(subcommand)]
    Experiment(ExperimentCommand),
}

#[derive(Args)]
pub struct DaemonOpts {
    /// TOML config file. Re-read on SIGHUP.
    #[arg(long, short = 'c', env = "VERIGATE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct StatusOpts {
    /// Print the raw JSON snapshot
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum ExperimentCommand {
    /// Queue canned outcomes for a package
    Add {
        #[arg(long)]
        package: String,
        /// Policy applied before each outcome (none, open, warn, block-fail-open, block-fail-closed)
        #[arg(long, default_value = "block-fail-closed")]
        policy: VerificationPolicy,
        /// Outcome codes: 1 pass, 2 reject, 3 incomplete, 4 network, 5 timeout, 6 disconnected, 7 infeasible
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        outcomes: Vec<i32>,
    },
    /// Check whether a package has queued outcomes
    Has {
        #[arg(long)]
        package: String,
    },
    /// Replay the next queued outcome and print the resulting events
    Run {
        #[arg(long)]
        package: String,
        /// Reject policy overrides instead of accepting them
        #[arg(long)]
        reject_policy: bool,
    },
}

/// Default socket path using $USER for per-user isolation.
pub fn default_socket_path() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/verigate/verigated.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/verigate-{user}/verigated.sock")
}
