//! UDS JSON-RPC server: installer and verifier APIs over one socket.
//!
//! Connections are persistent and newline-delimited. Installer methods take
//! explicit user ids. Verifier methods take the caller's identity from the
//! socket's peer credentials, never from the request body. Session callbacks
//! are pushed back to the installer connection that started the session as
//! `verification_event` notifications.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use verigate_controller::VerifierController;
use verigate_core::callback::VerifierCallback;
use verigate_core::experiment::ExperimentOutcome;
use verigate_core::types::{
    BypassReason, ExtensionBundle, IncompleteReason, Uid, UserId, VerificationId,
    VerificationPolicy, VerificationRequest, VerificationStatus,
};

use crate::rpc::{
    INTERNAL_ERROR, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND, NOT_VERIFIER, PARSE_ERROR, write_json,
};

// ─── Events ───────────────────────────────────────────────────────

/// One callback from the controller, as sent to the installer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VerificationEvent {
    ConnectionEstablished,
    ConnectionFailed,
    ConnectionInfeasible,
    TimeoutExtensionRequested,
    PolicyOverridden {
        policy: VerificationPolicy,
        accepted: bool,
    },
    Incomplete {
        reason: IncompleteReason,
    },
    Complete {
        status: VerificationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        extension_response: Option<ExtensionBundle>,
    },
    Bypassed {
        reason: BypassReason,
    },
    Timeout,
}

#[derive(Serialize)]
struct EventEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    verification_id: Option<VerificationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(flatten)]
    event: &'a VerificationEvent,
}

type Emit = Box<dyn Fn(VerificationEvent) + Send + Sync>;

/// [`VerifierCallback`] that turns every call into a [`VerificationEvent`].
struct EventCallback {
    accept_policy_overrides: bool,
    emit: Emit,
}

impl EventCallback {
    /// Push events to an installer connection.
    fn push(
        events: mpsc::UnboundedSender<JsonRpcNotification>,
        verification_id: Option<VerificationId>,
        user_id: Option<UserId>,
        accept_policy_overrides: bool,
    ) -> Self {
        let emit = move |event: VerificationEvent| {
            let envelope = EventEnvelope {
                verification_id,
                user_id,
                event: &event,
            };
            let params = match serde_json::to_value(&envelope) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode verification event");
                    return;
                }
            };
            if events
                .send(JsonRpcNotification::new("verification_event", params))
                .is_err()
            {
                tracing::debug!(?verification_id, ?event, "installer gone, event dropped");
            }
        };
        Self {
            accept_policy_overrides,
            emit: Box::new(emit),
        }
    }

    /// Record events into `sink`.
    fn collect(sink: Arc<Mutex<Vec<VerificationEvent>>>, accept_policy_overrides: bool) -> Self {
        let emit = move |event| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        };
        Self {
            accept_policy_overrides,
            emit: Box::new(emit),
        }
    }
}

impl VerifierCallback for EventCallback {
    fn on_connection_established(&self) {
        (self.emit)(VerificationEvent::ConnectionEstablished);
    }

    fn on_connection_failed(&self) {
        (self.emit)(VerificationEvent::ConnectionFailed);
    }

    fn on_connection_infeasible(&self) {
        (self.emit)(VerificationEvent::ConnectionInfeasible);
    }

    fn on_timeout_extension_requested(&self) {
        (self.emit)(VerificationEvent::TimeoutExtensionRequested);
    }

    fn on_verification_policy_overridden(&self, policy: VerificationPolicy) -> bool {
        let accepted = self.accept_policy_overrides;
        (self.emit)(VerificationEvent::PolicyOverridden { policy, accepted });
        accepted
    }

    fn on_verification_incomplete_received(&self, reason: IncompleteReason) {
        (self.emit)(VerificationEvent::Incomplete { reason });
    }

    fn on_verification_complete_received(
        &self,
        status: &VerificationStatus,
        extension_response: Option<&ExtensionBundle>,
    ) {
        (self.emit)(VerificationEvent::Complete {
            status: status.clone(),
            extension_response: extension_response.cloned(),
        });
    }

    fn on_verification_bypassed_received(&self, reason: BypassReason) {
        (self.emit)(VerificationEvent::Bypassed { reason });
    }

    fn on_timeout(&self) {
        (self.emit)(VerificationEvent::Timeout);
    }
}

// ─── Params ───────────────────────────────────────────────────────

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct StartParams {
    user_id: UserId,
    request: VerificationRequest,
    #[serde(default)]
    retry: bool,
    #[serde(default = "yes")]
    accept_policy_overrides: bool,
}

#[derive(Debug, Deserialize)]
struct PackageUserParams {
    package_name: String,
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct TimeoutNotifyParams {
    verification_id: VerificationId,
    user_id: UserId,
}

#[derive(Debug, Default, Deserialize)]
struct VerifierInfoParams {
    #[serde(default)]
    user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
struct AddExperimentParams {
    package_name: String,
    policy: VerificationPolicy,
    outcomes: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct ExperimentParams {
    package_name: String,
    #[serde(default = "yes")]
    accept_policy_overrides: bool,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    verification_id: VerificationId,
}

#[derive(Debug, Deserialize)]
struct ExtendParams {
    verification_id: VerificationId,
    additional_ms: u64,
}

#[derive(Debug, Deserialize)]
struct PolicyParams {
    verification_id: VerificationId,
    policy: VerificationPolicy,
}

#[derive(Debug, Deserialize)]
struct ReasonParams {
    verification_id: VerificationId,
    reason: i32,
}

#[derive(Debug, Deserialize)]
struct CompleteParams {
    verification_id: VerificationId,
    status: VerificationStatus,
    #[serde(default)]
    extension_response: Option<ExtensionBundle>,
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, JsonRpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(JsonRpcError::invalid_params)
}

pub(crate) fn render_deadline(ms: u64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms as i64).map(|d| d.to_rfc3339())
}

// ─── Server ───────────────────────────────────────────────────────

pub struct DaemonServer {
    socket_path: PathBuf,
    controller: VerifierController,
    cancel: CancellationToken,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        controller: VerifierController,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            controller,
            cancel,
        }
    }

    /// Bind the listener and serve until cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = bind_listener(&self.socket_path).await?;
        tracing::info!(path = %self.socket_path.display(), "server: listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let controller = self.controller.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, controller).await {
                                    tracing::debug!(error = %e, "client handler finished with error");
                                }
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("server: cancellation requested, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn bind_listener(socket_path: &Path) -> anyhow::Result<UnixListener> {
    let socket_dir = socket_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path: {}", socket_path.display()))?;
    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if socket_path.exists() {
        if UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!(path = %socket_path.display(), "removed stale socket");
        } else {
            anyhow::bail!("another daemon is already running at {}", socket_path.display());
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

// ─── Per-client handler ───────────────────────────────────────────

struct Connection {
    controller: VerifierController,
    peer_uid: Option<Uid>,
    events: mpsc::UnboundedSender<JsonRpcNotification>,
}

async fn handle_client(stream: UnixStream, controller: VerifierController) -> std::io::Result<()> {
    let peer_uid = match stream.peer_cred() {
        Ok(cred) => Some(Uid(cred.uid())),
        Err(e) => {
            tracing::warn!(error = %e, "peer credentials unavailable");
            None
        }
    };
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let conn = Connection {
        controller,
        peer_uid,
        events: events_tx,
    };

    tracing::debug!(peer_uid = ?peer_uid, "client connected");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(l) => l,
                    None => {
                        tracing::debug!("client disconnected (EOF)");
                        return Ok(());
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let resp = match serde_json::from_str::<JsonRpcRequest>(&line) {
                    Ok(req) => {
                        tracing::debug!(jsonrpc = %req.jsonrpc, method = %req.method, id = ?req.id, "request received");
                        let id = req.id;
                        match conn.handle(&req.method, req.params).await {
                            Ok(result) => JsonRpcResponse::ok(id, result),
                            Err(error) => {
                                tracing::debug!(method = %req.method, code = error.code, message = %error.message, "request failed");
                                JsonRpcResponse::err(id, error)
                            }
                        }
                    }
                    Err(e) => JsonRpcResponse::err(
                        None,
                        JsonRpcError::new(PARSE_ERROR, format!("parse error: {e}")),
                    ),
                };
                write_json(&mut writer, &resp).await?;
            }
            Some(notification) = events_rx.recv() => {
                write_json(&mut writer, &notification).await?;
            }
        }
    }
}

impl Connection {
    fn calling_uid(&self) -> Result<Uid, JsonRpcError> {
        self.peer_uid
            .ok_or_else(|| JsonRpcError::new(NOT_VERIFIER, "caller identity unavailable"))
    }

    fn callback(
        &self,
        verification_id: Option<VerificationId>,
        user_id: Option<UserId>,
        accept_policy_overrides: bool,
    ) -> Arc<dyn VerifierCallback> {
        Arc::new(EventCallback::push(
            self.events.clone(),
            verification_id,
            user_id,
            accept_policy_overrides,
        ))
    }

    async fn handle(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let controller = &self.controller;
        match method {
            // ── Installer API ──
            "bind" => {
                let p: UserParams = parse(params)?;
                let callback = self.callback(None, Some(p.user_id), true);
                let bound = controller
                    .bind_to_verifier_service_if_needed(p.user_id, callback)
                    .await?;
                Ok(json!({ "bound": bound }))
            }
            "start_verification_session" => {
                let p: StartParams = parse(params)?;
                let callback = self.callback(
                    Some(p.request.verification_id),
                    Some(p.user_id),
                    p.accept_policy_overrides,
                );
                let started = controller
                    .start_verification_session(p.user_id, p.request, callback, p.retry)
                    .await?;
                Ok(json!({ "started": started }))
            }
            "notify_package_name_available" => {
                let p: PackageUserParams = parse(params)?;
                controller.notify_package_name_available(p.package_name, p.user_id);
                Ok(json!({}))
            }
            "notify_verification_cancelled" => {
                let p: PackageUserParams = parse(params)?;
                controller.notify_verification_cancelled(p.package_name, p.user_id);
                Ok(json!({}))
            }
            "notify_verification_timeout" => {
                let p: TimeoutNotifyParams = parse(params)?;
                controller.notify_verification_timeout(p.verification_id, p.user_id);
                Ok(json!({}))
            }
            "verifier_info" => {
                let p: VerifierInfoParams = parse(params)?;
                let component = controller.verifier_component_name().await?;
                let uid = match p.user_id {
                    Some(user_id) => controller.verifier_uid_if_bound(user_id).await?,
                    None => None,
                };
                Ok(json!({
                    "component": component.as_ref().map(|c| c.to_string()),
                    "package_name": component.map(|c| c.package_name),
                    "uid": uid,
                }))
            }
            "status" => {
                let snapshot = controller.snapshot().await?;
                serde_json::to_value(snapshot)
                    .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))
            }
            "add_experiment" => {
                let p: AddExperimentParams = parse(params)?;
                let outcomes = ExperimentOutcome::parse_codes(&p.outcomes);
                let accepted = outcomes.len();
                let added = controller
                    .add_experiment(p.package_name, p.policy, outcomes)
                    .await?;
                Ok(json!({ "added": added, "outcomes": accepted }))
            }
            "has_experiments" => {
                let p: ExperimentParams = parse(params)?;
                let has = controller.has_experiments(p.package_name).await?;
                Ok(json!({ "has_experiments": has }))
            }
            "start_local_experiment" => {
                let p: ExperimentParams = parse(params)?;
                let events = Arc::new(Mutex::new(Vec::new()));
                let callback = Arc::new(EventCallback::collect(
                    Arc::clone(&events),
                    p.accept_policy_overrides,
                ));
                let ran = controller
                    .start_local_experiment(p.package_name, callback)
                    .await?;
                let events = std::mem::take(&mut *events.lock().unwrap_or_else(PoisonError::into_inner));
                Ok(json!({ "ran": ran, "events": events }))
            }

            // ── Verifier API ──
            "get_timeout_time" => {
                let uid = self.calling_uid()?;
                let p: SessionParams = parse(params)?;
                let deadline_ms = controller
                    .get_timeout_time_millis(uid, p.verification_id)
                    .await?;
                Ok(json!({ "deadline_ms": deadline_ms, "deadline": render_deadline(deadline_ms) }))
            }
            "extend_timeout" => {
                let uid = self.calling_uid()?;
                let p: ExtendParams = parse(params)?;
                let ext = controller
                    .extend_timeout_millis(uid, p.verification_id, p.additional_ms)
                    .await?;
                Ok(json!({
                    "granted_ms": ext.granted_ms,
                    "deadline_ms": ext.deadline_ms,
                    "deadline": render_deadline(ext.deadline_ms),
                }))
            }
            "set_verification_policy" => {
                let uid = self.calling_uid()?;
                let p: PolicyParams = parse(params)?;
                let accepted = controller
                    .set_verification_policy(uid, p.verification_id, p.policy)
                    .await?;
                Ok(json!({ "accepted": accepted }))
            }
            "report_verification_incomplete" => {
                let uid = self.calling_uid()?;
                let p: ReasonParams = parse(params)?;
                controller
                    .report_verification_incomplete(uid, p.verification_id, p.reason)
                    .await?;
                Ok(json!({}))
            }
            "report_verification_complete" => {
                let uid = self.calling_uid()?;
                let p: CompleteParams = parse(params)?;
                controller
                    .report_verification_complete(uid, p.verification_id, p.status, p.extension_response)
                    .await?;
                Ok(json!({}))
            }
            "report_verification_bypassed" => {
                let uid = self.calling_uid()?;
                let p: ReasonParams = parse(params)?;
                controller
                    .report_verification_bypassed(uid, p.verification_id, p.reason)
                    .await?;
                Ok(json!({}))
            }
            _ => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            )),
        }
    }
}
