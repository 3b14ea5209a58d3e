//! Verifier processes over stdio JSON-RPC.
//!
//! Each bind launches the configured verifier command as a child process.
//! The driver task performs an `initialize` handshake, then forwards
//! controller calls as JSON-RPC requests and resolves them on the matching
//! responses. The child exiting or closing stdout is reported as binder death.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use verigate_controller::{LifecycleSink, RemoteVerifier, ServiceBinder, ServiceError};
use verigate_core::types::{Uid, UserId, VerifierComponent, VerifierRequest};

use crate::config::VerifierProcessConfig;
use crate::rpc::JsonRpcResponse;

type Reply = oneshot::Sender<Result<(), ServiceError>>;

// ─── Binder ───────────────────────────────────────────────────────

/// [`ServiceBinder`] that launches one verifier process per bound user.
pub struct ProcessBinder {
    process: RwLock<VerifierProcessConfig>,
    socket_path: PathBuf,
}

impl ProcessBinder {
    pub fn new(process: VerifierProcessConfig, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            process: RwLock::new(process),
            socket_path: socket_path.into(),
        }
    }

    /// Applies to processes launched after this call.
    pub fn replace_process(&self, process: VerifierProcessConfig) {
        *self.process.write().unwrap_or_else(PoisonError::into_inner) = process;
    }
}

impl ServiceBinder for ProcessBinder {
    fn bind(
        &self,
        component: &VerifierComponent,
        user_id: UserId,
        uid: Uid,
        sink: LifecycleSink,
    ) -> Box<dyn RemoteVerifier> {
        let process = self
            .process
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let launch = Launch {
            handshake_timeout: process.handshake_timeout(),
            command: process.command,
            component: component.clone(),
            user_id,
            uid,
            socket_path: self.socket_path.clone(),
        };
        Box::new(ProcessVerifier::new(launch, sink))
    }
}

#[derive(Debug, Clone)]
struct Launch {
    command: Vec<String>,
    handshake_timeout: Duration,
    component: VerifierComponent,
    user_id: UserId,
    uid: Uid,
    socket_path: PathBuf,
}

impl Launch {
    fn spawn(&self) -> std::io::Result<Child> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no verifier command configured")
        })?;
        Command::new(program)
            .args(args)
            .env("VERIGATE_USER_ID", self.user_id.to_string())
            .env("VERIGATE_UID", self.uid.to_string())
            .env("VERIGATE_PACKAGE", &self.component.package_name)
            .env("VERIGATE_SERVICE", &self.component.service_name)
            .env("VERIGATE_SOCKET", &self.socket_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

// ─── Remote ───────────────────────────────────────────────────────

struct ProcessVerifier {
    launch: Launch,
    sink: LifecycleSink,
    outbound_tx: mpsc::UnboundedSender<(VerifierRequest, Reply)>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(VerifierRequest, Reply)>>>,
    cancel: CancellationToken,
}

impl ProcessVerifier {
    fn new(launch: Launch, sink: LifecycleSink) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            launch,
            sink,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
        }
    }
}

impl RemoteVerifier for ProcessVerifier {
    fn connect(&self) {
        let Some(outbound) = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let driver = Driver {
            launch: self.launch.clone(),
            sink: self.sink.clone(),
            outbound,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(driver.run());
    }

    fn post(&self, request: VerifierRequest) -> oneshot::Receiver<Result<(), ServiceError>> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError((_, reply))) = self.outbound_tx.send((request, reply)) {
            let _ = reply.send(Err(ServiceError::NotConnected));
        }
        rx
    }

    fn unbind(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProcessVerifier {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Driver ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct Outgoing<'a> {
    jsonrpc: &'static str,
    id: u64,
    #[serde(flatten)]
    request: &'a VerifierRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Unbound,
    Disconnected,
    Died,
}

struct Driver {
    launch: Launch,
    sink: LifecycleSink,
    outbound: mpsc::UnboundedReceiver<(VerifierRequest, Reply)>,
    cancel: CancellationToken,
}

struct Channel {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    pending: HashMap<u64, (&'static str, Reply)>,
}

impl Driver {
    async fn run(mut self) {
        let user_id = self.launch.user_id;
        let mut child = match self.launch.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "verifier: launch failed");
                self.sink.binder_died();
                return;
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            tracing::warn!(user_id = %user_id, "verifier: stdio not piped");
            self.sink.binder_died();
            return;
        };
        let mut channel = Channel {
            stdin,
            lines: BufReader::new(stdout).lines(),
            next_id: 1,
            pending: HashMap::new(),
        };

        let handshake = tokio::select! {
            r = tokio::time::timeout(self.launch.handshake_timeout, channel.initialize(&self.launch)) => r,
            _ = self.cancel.cancelled() => return,
        };
        match handshake {
            Ok(Ok(())) => {
                tracing::info!(user_id = %user_id, pid = ?child.id(), "verifier: connected");
                self.sink.connected();
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "verifier: handshake failed");
                self.sink.binder_died();
                return;
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "verifier: handshake timed out");
                self.sink.binder_died();
                return;
            }
        }

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(user_id = %user_id, "verifier: unbound");
                    break End::Unbound;
                }
                Some((request, reply)) = self.outbound.recv() => {
                    if let Err(e) = channel.send_request(&request, reply).await {
                        tracing::warn!(user_id = %user_id, error = %e, "verifier: write failed");
                        break End::Disconnected;
                    }
                }
                line = channel.lines.next_line() => match line {
                    Ok(Some(line)) => channel.handle_line(&line),
                    Ok(None) => {
                        tracing::info!(user_id = %user_id, "verifier: closed stdout");
                        break End::Died;
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "verifier: read failed");
                        break End::Died;
                    }
                },
            }
        };

        channel.fail_pending(end == End::Unbound);
        match end {
            End::Died => self.sink.binder_died(),
            End::Disconnected => self.sink.disconnected(),
            End::Unbound => {}
        }
        if let Err(e) = child.start_kill() {
            tracing::debug!(user_id = %user_id, error = %e, "verifier: kill failed");
        }
    }
}

impl Channel {
    async fn initialize(&mut self, launch: &Launch) -> anyhow::Result<()> {
        let id = self.alloc_id();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "verifier": launch.component,
                "user_id": launch.user_id,
                "uid": launch.uid,
                "socket": launch.socket_path,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.write_line(&request).await?;

        loop {
            let Some(line) = self.lines.next_line().await? else {
                anyhow::bail!("verifier closed stdout during handshake");
            };
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                continue;
            };
            if response.id != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                anyhow::bail!("initialize error: {}", error.message);
            }
            break;
        }

        let initialized = serde_json::json!({"jsonrpc": "2.0", "method": "initialized", "params": {}});
        self.write_line(&initialized).await?;
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn write_line<T: Serialize>(&mut self, msg: &T) -> std::io::Result<()> {
        crate::rpc::write_json(&mut self.stdin, msg).await
    }

    async fn send_request(&mut self, request: &VerifierRequest, reply: Reply) -> std::io::Result<()> {
        let id = self.alloc_id();
        let outgoing = Outgoing {
            jsonrpc: "2.0",
            id,
            request,
        };
        self.pending.insert(id, (request.method(), reply));
        self.write_line(&outgoing).await
    }

    fn handle_line(&mut self, line: &str) {
        let response = match serde_json::from_str::<JsonRpcResponse>(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "verifier: ignoring unparseable line");
                return;
            }
        };
        let Some((method, reply)) = response.id.and_then(|id| self.pending.remove(&id)) else {
            tracing::debug!(id = ?response.id, "verifier: response for unknown request");
            return;
        };
        let result = match response.error {
            None => Ok(()),
            Some(error) => Err(ServiceError::Remote {
                method: method.to_string(),
                message: error.message,
            }),
        };
        let _ = reply.send(result);
    }

    fn fail_pending(&mut self, unbound: bool) {
        for (_, (method, reply)) in self.pending.drain() {
            tracing::debug!(method, unbound, "verifier: failing pending call");
            let err = if unbound {
                ServiceError::Unbound
            } else {
                ServiceError::NotConnected
            };
            let _ = reply.send(Err(err));
        }
    }
}
