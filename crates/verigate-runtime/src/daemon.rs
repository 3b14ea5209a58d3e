//! Daemon wiring: config, controller actor, UDS server, and signal handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use verigate_controller::{TokioClock, VerifierController};

use crate::cli::DaemonOpts;
use crate::config::{ConfigResolver, RuntimeConfig};
use crate::process_binder::ProcessBinder;
use crate::server::DaemonServer;

/// Run the daemon: starts the controller and UDS server, reloads on SIGHUP,
/// stops on ctrl-c or SIGTERM.
pub async fn run_daemon(opts: DaemonOpts, socket_path: &str) -> anyhow::Result<()> {
    let config = RuntimeConfig::load_or_default(opts.config.as_deref())?;
    log_config(&config, opts.config.as_deref());

    let resolver = Arc::new(ConfigResolver::new(&config.installed));
    let binder = Arc::new(ProcessBinder::new(config.verifier.clone(), socket_path));
    let cancel = CancellationToken::new();

    let (controller, controller_handle) = VerifierController::spawn(
        binder.clone(),
        resolver.clone(),
        Arc::new(TokioClock::new()),
        config.controller,
        cancel.clone(),
    );

    let server = DaemonServer::new(socket_path, controller.clone(), cancel.clone());
    let mut server_handle = tokio::spawn(server.run());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let reload = Reloader {
        path: opts.config,
        resolver,
        binder,
        controller,
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                reload.reload().await;
            }
            result = &mut server_handle => {
                match result {
                    Ok(Ok(())) => tracing::warn!("server exited unexpectedly"),
                    Ok(Err(e)) => tracing::error!("UDS server error: {e}"),
                    Err(e) => tracing::error!("UDS server task failed: {e}"),
                }
                break;
            }
        }
    }

    cancel.cancel();
    if let Err(e) = controller_handle.await {
        tracing::warn!("controller task failed: {e}");
    }

    let _ = std::fs::remove_file(socket_path);
    tracing::info!("daemon stopped");
    Ok(())
}

fn log_config(config: &RuntimeConfig, path: Option<&Path>) {
    tracing::info!(
        config = ?path,
        verifier = ?config.controller.verifier.as_ref().map(ToString::to_string),
        installed = config.installed.len(),
        request_timeout_ms = config.controller.verification_request_timeout_ms,
        connection_timeout_ms = config.controller.verifier_connection_timeout_ms,
        "config loaded"
    );
    if config.controller.verifier.is_some() && config.verifier.command.is_empty() {
        tracing::warn!("verifier configured without [verifier] command; binds will fail");
    }
}

struct Reloader {
    path: Option<PathBuf>,
    resolver: Arc<ConfigResolver>,
    binder: Arc<ProcessBinder>,
    controller: VerifierController,
}

impl Reloader {
    /// Re-read the config file. A file that fails to load leaves everything as is.
    async fn reload(&self) {
        let Some(path) = self.path.as_deref() else {
            tracing::info!("received SIGHUP without a config file, nothing to reload");
            return;
        };
        let config = match RuntimeConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config reload failed, keeping current config");
                return;
            }
        };
        log_config(&config, Some(path));
        self.resolver.replace(&config.installed);
        self.binder.replace_process(config.verifier);
        if let Err(e) = self.controller.reload_config(config.controller).await {
            tracing::warn!(error = %e, "controller rejected config reload");
        }
    }
}
