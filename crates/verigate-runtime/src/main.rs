//! verigate: verifier session controller daemon and CLI.
//! The daemon embeds the controller actor and serves installers and
//! verifiers over one UDS.

use clap::Parser;

mod cli;
mod client;
mod config;
mod daemon;
mod process_binder;
mod rpc;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let socket_path = args.socket_path.unwrap_or_else(cli::default_socket_path);

    match args.command {
        cli::Command::Daemon(opts) => {
            let filter = std::env::var("VERIGATE_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            tracing::info!(version = env!("CARGO_PKG_VERSION"), "verigate daemon starting");
            daemon::run_daemon(opts, &socket_path).await?;
        }
        cli::Command::Status(opts) => {
            client::cmd_status(&socket_path, opts.json).await?;
        }
        cli::Command::Experiment(command) => {
            client::cmd_experiment(&socket_path, command).await?;
        }
    }

    Ok(())
}
