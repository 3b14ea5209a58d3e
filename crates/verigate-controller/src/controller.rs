//! The verifier session controller.
//!
//! One tokio task owns every piece of mutable state: bound verifier handles
//! (one per user), live session trackers, per-user session counts, the
//! experiment provider and all timers. [`VerifierController`] is a cheap
//! handle that sends commands to that task and awaits the reply, so state
//! transitions are serialized without locks.
//!
//! Timers live in a single `DelayQueue`:
//! - one per live verification id, reset whenever its deadline moves;
//! - one idle-disconnect countdown per user, armed while the user has no sessions;
//! - one expiry per experiment package.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

use verigate_core::callback::VerifierCallback;
use verigate_core::clock::Clock;
use verigate_core::config::{ControllerConfig, MAX_TIMEOUT_MS};
use verigate_core::experiment::{ExperimentOutcome, ExperimentProvider};
use verigate_core::tracker::{Extension, SessionStatusTracker};
use verigate_core::types::{
    BypassReason, ExtensionBundle, IncompleteReason, Uid, UserId, VerificationId,
    VerificationPolicy, VerificationRequest, VerificationStatus, VerifierComponent,
    VerifierRequest,
};

use crate::binder::{
    LifecycleEvent, LifecycleNotice, LifecycleSink, PackageResolver, RemoteVerifier,
    ServiceBinder, post_and_forget,
};
use crate::error::ControllerError;

type Reply<T> = oneshot::Sender<T>;
type CallbackRef = Arc<dyn VerifierCallback>;

// ─── Commands ─────────────────────────────────────────────────────

enum Command {
    Bind {
        user_id: UserId,
        callback: CallbackRef,
        reply: Reply<bool>,
    },
    StartSession {
        user_id: UserId,
        request: VerificationRequest,
        callback: CallbackRef,
        retry: bool,
        reply: Reply<bool>,
    },
    Notify {
        user_id: UserId,
        request: VerifierRequest,
    },
    AssertCaller {
        calling_uid: Uid,
        reply: Reply<Result<(), ControllerError>>,
    },
    Inbound {
        calling_uid: Uid,
        verification_id: VerificationId,
        call: InboundCall,
    },
    AddExperiment {
        package: String,
        policy: VerificationPolicy,
        outcomes: Vec<ExperimentOutcome>,
        reply: Reply<bool>,
    },
    HasExperiments {
        package: String,
        reply: Reply<bool>,
    },
    StartLocalExperiment {
        package: String,
        callback: CallbackRef,
        reply: Reply<bool>,
    },
    ReloadConfig {
        config: ControllerConfig,
        reply: Reply<()>,
    },
    VerifierComponentName {
        reply: Reply<Option<VerifierComponent>>,
    },
    VerifierUidIfBound {
        user_id: UserId,
        reply: Reply<Option<Uid>>,
    },
    Snapshot {
        reply: Reply<ControllerSnapshot>,
    },
}

/// Calls made by the verifier about one of its sessions.
enum InboundCall {
    GetTimeoutTime(Reply<Result<u64, ControllerError>>),
    ExtendTimeout {
        additional_ms: u64,
        reply: Reply<Result<Extension, ControllerError>>,
    },
    SetPolicy {
        policy: VerificationPolicy,
        reply: Reply<Result<bool, ControllerError>>,
    },
    ReportIncomplete {
        code: i32,
        reply: Reply<Result<(), ControllerError>>,
    },
    ReportComplete {
        status: VerificationStatus,
        extension_response: Option<ExtensionBundle>,
        reply: Reply<Result<(), ControllerError>>,
    },
    ReportBypassed {
        code: i32,
        reply: Reply<Result<(), ControllerError>>,
    },
}

/// A dispatch that was not acknowledged within the connection timeout.
#[derive(Debug)]
struct DispatchFailure {
    verification_id: VerificationId,
    seq: u64,
    reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Session(VerificationId),
    AutoDisconnect(UserId),
    ExperimentExpiry(String),
}

// ─── Snapshot ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleInfo {
    pub user_id: UserId,
    pub uid: Uid,
    pub package_name: String,
    pub connected: bool,
    pub idle_disconnect_armed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub verification_id: VerificationId,
    pub user_id: UserId,
    pub package_name: String,
    pub dispatched_at_ms: u64,
    pub deadline_ms: u64,
}

/// Point-in-time view of the controller, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerSnapshot {
    pub verifier: Option<VerifierComponent>,
    pub handles: Vec<HandleInfo>,
    pub sessions: Vec<SessionInfo>,
    pub session_counts: BTreeMap<UserId, usize>,
    pub experiments: Vec<String>,
}

// ─── Handle ───────────────────────────────────────────────────────

/// Handle to the controller task. Clones share the same task.
#[derive(Clone)]
pub struct VerifierController {
    tx: mpsc::UnboundedSender<Command>,
}

impl VerifierController {
    /// Start the controller task. It runs until `cancel` fires or every
    /// handle is dropped, and unbinds all verifiers on the way out.
    pub fn spawn(
        binder: Arc<dyn ServiceBinder>,
        resolver: Arc<dyn PackageResolver>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut actor = ControllerActor::new(binder, resolver, clock, config, rx, cancel);
        let task = tokio::spawn(async move { actor.run().await });
        (Self { tx }, task)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ControllerError::ShutDown)?;
        rx.await.map_err(|_| ControllerError::ShutDown)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("controller: shut down, dropping notification");
        }
    }

    // ── Installer API ──

    /// Make sure a verifier connection for `user_id` exists or is being set up.
    ///
    /// `false` when no verifier is configured or it is not installed for the
    /// user. `true` does not mean the connection works; that is reported
    /// through `callback`.
    pub async fn bind_to_verifier_service_if_needed(
        &self,
        user_id: UserId,
        callback: CallbackRef,
    ) -> Result<bool, ControllerError> {
        self.call(|reply| Command::Bind {
            user_id,
            callback,
            reply,
        })
        .await
    }

    /// Dispatch a verification request and start its timeout.
    pub async fn start_verification_session(
        &self,
        user_id: UserId,
        request: VerificationRequest,
        callback: CallbackRef,
        retry: bool,
    ) -> Result<bool, ControllerError> {
        self.call(|reply| Command::StartSession {
            user_id,
            request,
            callback,
            retry,
            reply,
        })
        .await
    }

    pub fn notify_package_name_available(&self, package_name: impl Into<String>, user_id: UserId) {
        self.send(Command::Notify {
            user_id,
            request: VerifierRequest::PackageNameAvailable {
                package_name: package_name.into(),
            },
        });
    }

    pub fn notify_verification_cancelled(&self, package_name: impl Into<String>, user_id: UserId) {
        self.send(Command::Notify {
            user_id,
            request: VerifierRequest::VerificationCancelled {
                package_name: package_name.into(),
            },
        });
    }

    pub fn notify_verification_timeout(&self, verification_id: VerificationId, user_id: UserId) {
        self.send(Command::Notify {
            user_id,
            request: VerifierRequest::VerificationTimeout { verification_id },
        });
    }

    pub async fn verifier_component_name(&self) -> Result<Option<VerifierComponent>, ControllerError> {
        self.call(|reply| Command::VerifierComponentName { reply }).await
    }

    pub async fn verifier_package_name(&self) -> Result<Option<String>, ControllerError> {
        Ok(self.verifier_component_name().await?.map(|c| c.package_name))
    }

    pub async fn verifier_uid_if_bound(&self, user_id: UserId) -> Result<Option<Uid>, ControllerError> {
        self.call(|reply| Command::VerifierUidIfBound { user_id, reply })
            .await
    }

    pub async fn add_experiment(
        &self,
        package: impl Into<String>,
        policy: VerificationPolicy,
        outcomes: Vec<ExperimentOutcome>,
    ) -> Result<bool, ControllerError> {
        let package = package.into();
        self.call(|reply| Command::AddExperiment {
            package,
            policy,
            outcomes,
            reply,
        })
        .await
    }

    pub async fn has_experiments(&self, package: impl Into<String>) -> Result<bool, ControllerError> {
        let package = package.into();
        self.call(|reply| Command::HasExperiments { package, reply })
            .await
    }

    pub async fn start_local_experiment(
        &self,
        package: impl Into<String>,
        callback: CallbackRef,
    ) -> Result<bool, ControllerError> {
        let package = package.into();
        self.call(|reply| Command::StartLocalExperiment {
            package,
            callback,
            reply,
        })
        .await
    }

    /// Swap in new settings. They apply to sessions dispatched afterwards.
    /// Swap in a new config. An invalid config is refused before it reaches the actor.
    pub async fn reload_config(&self, config: ControllerConfig) -> Result<(), ControllerError> {
        config.validate()?;
        self.call(|reply| Command::ReloadConfig { config, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, ControllerError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    // ── Verifier API ──

    pub async fn assert_caller_is_current_verifier(&self, calling_uid: Uid) -> Result<(), ControllerError> {
        self.call(|reply| Command::AssertCaller { calling_uid, reply })
            .await?
    }

    async fn inbound<T>(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
        make: impl FnOnce(Reply<Result<T, ControllerError>>) -> InboundCall,
    ) -> Result<T, ControllerError> {
        self.call(|reply| Command::Inbound {
            calling_uid,
            verification_id,
            call: make(reply),
        })
        .await?
    }

    /// Current deadline of a session, epoch ms.
    pub async fn get_timeout_time_millis(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
    ) -> Result<u64, ControllerError> {
        self.inbound(calling_uid, verification_id, InboundCall::GetTimeoutTime)
            .await
    }

    pub async fn extend_timeout_millis(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
        additional_ms: u64,
    ) -> Result<Extension, ControllerError> {
        self.inbound(calling_uid, verification_id, |reply| {
            InboundCall::ExtendTimeout {
                additional_ms,
                reply,
            }
        })
        .await
    }

    pub async fn set_verification_policy(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
        policy: VerificationPolicy,
    ) -> Result<bool, ControllerError> {
        self.inbound(calling_uid, verification_id, |reply| InboundCall::SetPolicy {
            policy,
            reply,
        })
        .await
    }

    pub async fn report_verification_incomplete(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
        code: i32,
    ) -> Result<(), ControllerError> {
        self.inbound(calling_uid, verification_id, |reply| {
            InboundCall::ReportIncomplete { code, reply }
        })
        .await
    }

    pub async fn report_verification_complete(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
        status: VerificationStatus,
        extension_response: Option<ExtensionBundle>,
    ) -> Result<(), ControllerError> {
        self.inbound(calling_uid, verification_id, |reply| {
            InboundCall::ReportComplete {
                status,
                extension_response,
                reply,
            }
        })
        .await
    }

    pub async fn report_verification_bypassed(
        &self,
        calling_uid: Uid,
        verification_id: VerificationId,
        code: i32,
    ) -> Result<(), ControllerError> {
        self.inbound(calling_uid, verification_id, |reply| {
            InboundCall::ReportBypassed { code, reply }
        })
        .await
    }
}

// ─── Actor ────────────────────────────────────────────────────────

struct ServiceHandle {
    remote: Box<dyn RemoteVerifier>,
    component: VerifierComponent,
    uid: Uid,
    generation: u64,
    connected: bool,
    callback: CallbackRef,
}

struct ActiveSession {
    tracker: SessionStatusTracker,
    package_name: String,
    callback: CallbackRef,
    seq: u64,
}

struct ControllerActor {
    binder: Arc<dyn ServiceBinder>,
    resolver: Arc<dyn PackageResolver>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,

    handles: HashMap<UserId, ServiceHandle>,
    sessions: HashMap<VerificationId, ActiveSession>,
    session_counts: HashMap<UserId, usize>,
    experiments: ExperimentProvider,

    timers: DelayQueue<TimerKey>,
    timer_keys: HashMap<TimerKey, delay_queue::Key>,

    next_generation: u64,
    next_session_seq: u64,

    commands: mpsc::UnboundedReceiver<Command>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleNotice>,
    lifecycle_rx: mpsc::UnboundedReceiver<LifecycleNotice>,
    dispatch_tx: mpsc::UnboundedSender<DispatchFailure>,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchFailure>,
    cancel: CancellationToken,
}

impl ControllerActor {
    fn new(
        binder: Arc<dyn ServiceBinder>,
        resolver: Arc<dyn PackageResolver>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Self {
            binder,
            resolver,
            clock,
            config,
            handles: HashMap::new(),
            sessions: HashMap::new(),
            session_counts: HashMap::new(),
            experiments: ExperimentProvider::new(),
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            next_generation: 0,
            next_session_seq: 0,
            commands,
            lifecycle_tx,
            lifecycle_rx,
            dispatch_tx,
            dispatch_rx,
            cancel,
        }
    }

    async fn run(&mut self) {
        info!(
            verifier = ?self.config.verifier.as_ref().map(|c| c.to_string()),
            "controller: event loop started"
        );
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("controller: all handles dropped, shutting down");
                            break;
                        }
                    }
                }
                Some(notice) = self.lifecycle_rx.recv() => self.handle_lifecycle(notice),
                Some(failure) = self.dispatch_rx.recv() => self.handle_dispatch_failure(failure),
                Some(expired) = std::future::poll_fn(|cx| self.timers.poll_expired(cx)) => {
                    let key = expired.into_inner();
                    self.timer_keys.remove(&key);
                    self.handle_timer(key);
                }
                _ = self.cancel.cancelled() => {
                    info!("controller: cancellation requested, shutting down");
                    break;
                }
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let users: Vec<UserId> = self.handles.keys().copied().collect();
        for user_id in users {
            self.destroy_handle(user_id);
        }
        self.timers.clear();
        self.timer_keys.clear();
        info!(
            live_sessions = self.sessions.len(),
            "controller: stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Bind {
                user_id,
                callback,
                reply,
            } => {
                let _ = reply.send(self.bind_if_needed(user_id, callback));
            }
            Command::StartSession {
                user_id,
                request,
                callback,
                retry,
                reply,
            } => {
                let _ = reply.send(self.start_session(user_id, request, callback, retry));
            }
            Command::Notify { user_id, request } => self.notify(user_id, request),
            Command::AssertCaller { calling_uid, reply } => {
                let _ = reply.send(self.assert_caller(calling_uid));
            }
            Command::Inbound {
                calling_uid,
                verification_id,
                call,
            } => self.handle_inbound(calling_uid, verification_id, call),
            Command::AddExperiment {
                package,
                policy,
                outcomes,
                reply,
            } => {
                let _ = reply.send(self.add_experiment(package, policy, outcomes));
            }
            Command::HasExperiments { package, reply } => {
                let _ = reply.send(self.experiments.has_experiments(&package));
            }
            Command::StartLocalExperiment {
                package,
                callback,
                reply,
            } => {
                let _ = reply.send(self.run_experiment(&package, callback.as_ref()));
            }
            Command::ReloadConfig { config, reply } => {
                self.reload_config(config);
                let _ = reply.send(());
            }
            Command::VerifierComponentName { reply } => {
                let _ = reply.send(self.config.verifier.clone());
            }
            Command::VerifierUidIfBound { user_id, reply } => {
                let _ = reply.send(self.handles.get(&user_id).map(|h| h.uid));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // ── Timers ──

    fn arm(&mut self, key: TimerKey, after: Duration) {
        let after = after.min(Duration::from_millis(MAX_TIMEOUT_MS));
        match self.timer_keys.get(&key) {
            Some(existing) => self.timers.reset(existing, after),
            None => {
                let handle = self.timers.insert(key.clone(), after);
                self.timer_keys.insert(key, handle);
            }
        }
    }

    fn disarm(&mut self, key: &TimerKey) -> bool {
        match self.timer_keys.remove(key) {
            Some(handle) => {
                self.timers.remove(&handle);
                true
            }
            None => false,
        }
    }

    fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Session(id) => self.check_session_timeout(id),
            TimerKey::AutoDisconnect(user_id) => self.idle_disconnect(user_id),
            TimerKey::ExperimentExpiry(package) => {
                self.experiments.expire(&package);
            }
        }
    }

    // ── Binding ──

    fn bind_if_needed(&mut self, user_id: UserId, callback: CallbackRef) -> bool {
        let Some(component) = self.config.verifier.clone() else {
            debug!(user_id = %user_id, "controller: no verifier configured");
            return false;
        };
        let Some(uid) = self.resolver.package_uid(&component.package_name, user_id) else {
            warn!(
                user_id = %user_id,
                package = %component.package_name,
                "controller: verifier not installed for user"
            );
            return false;
        };

        if let Some(handle) = self.handles.get(&user_id) {
            if handle.component == component && handle.uid == uid {
                return true;
            }
            info!(
                user_id = %user_id,
                old = %handle.component,
                new = %component,
                "controller: verifier changed, rebinding"
            );
            self.destroy_handle(user_id);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = LifecycleSink::new(user_id, generation, self.lifecycle_tx.clone());
        let remote = self.binder.bind(&component, user_id, uid, sink);
        remote.connect();
        info!(user_id = %user_id, uid = %uid, verifier = %component, generation, "controller: binding verifier");
        self.handles.insert(
            user_id,
            ServiceHandle {
                remote,
                component,
                uid,
                generation,
                connected: false,
                callback,
            },
        );
        true
    }

    fn destroy_handle(&mut self, user_id: UserId) -> Option<ServiceHandle> {
        let handle = self.handles.remove(&user_id)?;
        self.disarm(&TimerKey::AutoDisconnect(user_id));
        handle.remote.unbind();
        debug!(user_id = %user_id, generation = handle.generation, "controller: verifier unbound");
        Some(handle)
    }

    fn is_current(&self, notice: &LifecycleNotice) -> bool {
        self.handles
            .get(&notice.user_id)
            .is_some_and(|h| h.generation == notice.generation)
    }

    fn handle_lifecycle(&mut self, notice: LifecycleNotice) {
        if !self.is_current(&notice) {
            debug!(
                user_id = %notice.user_id,
                generation = notice.generation,
                event = ?notice.event,
                "controller: ignoring event from stale connection"
            );
            return;
        }
        let user_id = notice.user_id;
        match notice.event {
            LifecycleEvent::Connected => {
                let Some(handle) = self.handles.get_mut(&user_id) else {
                    return;
                };
                handle.connected = true;
                let callback = handle.callback.clone();
                info!(user_id = %user_id, "controller: verifier connected");
                callback.on_connection_established();
                if self.session_count(user_id) == 0 {
                    self.arm_auto_disconnect(user_id);
                }
            }
            LifecycleEvent::Disconnected | LifecycleEvent::BinderDied => {
                warn!(user_id = %user_id, event = ?notice.event, "controller: verifier connection lost");
                self.destroy_handle(user_id);
                self.fail_user_sessions(user_id);
            }
        }
    }

    fn fail_user_sessions(&mut self, user_id: UserId) {
        let ids: Vec<VerificationId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.tracker.user_id() == user_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(session) = self.remove_session(id) {
                info!(user_id = %user_id, verification_id = %id, "controller: failing session after disconnect");
                session.callback.on_connection_failed();
            }
        }
    }

    // ── Idle disconnect ──

    fn session_count(&self, user_id: UserId) -> usize {
        self.session_counts.get(&user_id).copied().unwrap_or(0)
    }

    fn arm_auto_disconnect(&mut self, user_id: UserId) {
        if !self.handles.contains_key(&user_id) {
            return;
        }
        let after = self.config.auto_disconnect_timeout();
        debug!(user_id = %user_id, after_ms = after.as_millis() as u64, "controller: idle disconnect armed");
        self.arm(TimerKey::AutoDisconnect(user_id), after);
    }

    fn idle_disconnect(&mut self, user_id: UserId) {
        if self.session_count(user_id) > 0 {
            return;
        }
        if self.destroy_handle(user_id).is_some() {
            info!(user_id = %user_id, "controller: verifier idle, disconnected");
        }
    }

    // ── Dispatch ──

    fn notify(&mut self, user_id: UserId, request: VerifierRequest) {
        match self.handles.get(&user_id) {
            Some(handle) => post_and_forget(handle.remote.as_ref(), user_id, request),
            None => debug!(
                user_id = %user_id,
                method = request.method(),
                "controller: verifier not bound, notification dropped"
            ),
        }
    }

    fn start_session(
        &mut self,
        user_id: UserId,
        request: VerificationRequest,
        callback: CallbackRef,
        retry: bool,
    ) -> bool {
        if !self.bind_if_needed(user_id, callback.clone()) {
            return false;
        }
        let Some(handle) = self.handles.get(&user_id) else {
            return false;
        };

        let verification_id = request.verification_id;
        let package_name = request.package_name.clone();
        let message = if retry {
            VerifierRequest::VerificationRetry(request)
        } else {
            VerifierRequest::VerificationRequired(request)
        };
        let ack = handle.remote.post(message);

        if self.remove_session(verification_id).is_some() {
            warn!(verification_id = %verification_id, "controller: replacing live session with same id");
        }

        self.next_session_seq += 1;
        let seq = self.next_session_seq;
        let now = self.clock.now_ms();
        let tracker = SessionStatusTracker::new(
            user_id,
            now,
            self.config.verification_request_timeout_ms,
            self.config.max_verification_request_extended_timeout_ms,
        );
        self.disarm(&TimerKey::AutoDisconnect(user_id));
        *self.session_counts.entry(user_id).or_default() += 1;
        // The tracker clamps the deadline to the extension cap; the timer follows it.
        self.arm(
            TimerKey::Session(verification_id),
            Duration::from_millis(tracker.remaining_ms(now)),
        );
        info!(
            user_id = %user_id,
            verification_id = %verification_id,
            package = %package_name,
            retry,
            deadline_ms = tracker.deadline_ms(),
            "controller: verification dispatched"
        );
        self.sessions.insert(
            verification_id,
            ActiveSession {
                tracker,
                package_name,
                callback,
                seq,
            },
        );

        let timeout = self.config.connection_timeout();
        let failures = self.dispatch_tx.clone();
        tokio::spawn(async move {
            let reason = match tokio::time::timeout(timeout, ack).await {
                Ok(Ok(Ok(()))) => return,
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(_)) => "verifier dropped the request".to_string(),
                Err(_) => format!("not acknowledged within {}ms", timeout.as_millis()),
            };
            let _ = failures.send(DispatchFailure {
                verification_id,
                seq,
                reason,
            });
        });
        true
    }

    fn handle_dispatch_failure(&mut self, failure: DispatchFailure) {
        let live = self
            .sessions
            .get(&failure.verification_id)
            .is_some_and(|s| s.seq == failure.seq);
        if !live {
            debug!(
                verification_id = %failure.verification_id,
                reason = %failure.reason,
                "controller: dispatch failed for finished session"
            );
            return;
        }
        warn!(
            verification_id = %failure.verification_id,
            reason = %failure.reason,
            "controller: dispatch failed"
        );
        if let Some(session) = self.remove_session(failure.verification_id) {
            session.callback.on_connection_failed();
        }
    }

    // ── Sessions ──

    /// Drop a session and its timer. Arms the idle countdown when it was the
    /// user's last one.
    fn remove_session(&mut self, id: VerificationId) -> Option<ActiveSession> {
        let session = self.sessions.remove(&id)?;
        self.disarm(&TimerKey::Session(id));
        let user_id = session.tracker.user_id();
        let remaining = match self.session_counts.get_mut(&user_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.session_counts.remove(&user_id);
            self.arm_auto_disconnect(user_id);
        }
        Some(session)
    }

    fn check_session_timeout(&mut self, id: VerificationId) {
        let now = self.clock.now_ms();
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        if !session.tracker.is_expired(now) {
            let remaining = session.tracker.remaining_ms(now);
            self.arm(TimerKey::Session(id), Duration::from_millis(remaining));
            return;
        }
        if let Some(session) = self.remove_session(id) {
            info!(
                user_id = %session.tracker.user_id(),
                verification_id = %id,
                "controller: verification timed out"
            );
            session.callback.on_timeout();
        }
    }

    // ── Inbound ──

    fn assert_caller(&self, calling_uid: Uid) -> Result<(), ControllerError> {
        let user_id = calling_uid.user_id();
        let handle = self
            .handles
            .get(&user_id)
            .ok_or(ControllerError::VerifierDisconnected { user_id })?;
        if handle.uid != calling_uid {
            warn!(
                calling_uid = %calling_uid,
                verifier_uid = %handle.uid,
                "controller: call from non-verifier uid"
            );
            return Err(ControllerError::CallerNotVerifier { calling_uid });
        }
        Ok(())
    }

    /// The caller's live session, scoped to the caller's user.
    fn session_for(
        &mut self,
        calling_uid: Uid,
        verification_id: VerificationId,
    ) -> Result<&mut ActiveSession, ControllerError> {
        self.sessions
            .get_mut(&verification_id)
            .filter(|s| s.tracker.user_id() == calling_uid.user_id())
            .ok_or(ControllerError::SessionNotFound { verification_id })
    }

    fn handle_inbound(&mut self, calling_uid: Uid, id: VerificationId, call: InboundCall) {
        let authorized = self.assert_caller(calling_uid);
        match call {
            InboundCall::GetTimeoutTime(reply) => {
                let result = authorized
                    .and_then(|()| self.session_for(calling_uid, id))
                    .map(|s| s.tracker.deadline_ms());
                let _ = reply.send(result);
            }
            InboundCall::ExtendTimeout {
                additional_ms,
                reply,
            } => {
                let result = authorized.and_then(|()| self.extend(calling_uid, id, additional_ms));
                let _ = reply.send(result);
            }
            InboundCall::SetPolicy { policy, reply } => {
                let result = authorized
                    .and_then(|()| self.session_for(calling_uid, id))
                    .map(|s| s.callback.on_verification_policy_overridden(policy));
                if let Ok(accepted) = result {
                    debug!(verification_id = %id, %policy, accepted, "controller: policy override");
                }
                let _ = reply.send(result);
            }
            InboundCall::ReportIncomplete { code, reply } => {
                let result = authorized.and_then(|()| {
                    let reason = IncompleteReason::from_code(code).ok_or(
                        ControllerError::InvalidIncompleteReason {
                            verification_id: id,
                            code,
                        },
                    )?;
                    let session = self.finish(calling_uid, id)?;
                    info!(verification_id = %id, ?reason, "controller: verification incomplete");
                    session.callback.on_verification_incomplete_received(reason);
                    Ok(())
                });
                let _ = reply.send(result);
            }
            InboundCall::ReportComplete {
                status,
                extension_response,
                reply,
            } => {
                let result = authorized.and_then(|()| {
                    let session = self.finish(calling_uid, id)?;
                    info!(verification_id = %id, verified = status.verified, "controller: verification complete");
                    session
                        .callback
                        .on_verification_complete_received(&status, extension_response.as_ref());
                    Ok(())
                });
                let _ = reply.send(result);
            }
            InboundCall::ReportBypassed { code, reply } => {
                let result = authorized.and_then(|()| {
                    self.session_for(calling_uid, id)?;
                    let reason = BypassReason(code);
                    if !reason.is_valid() {
                        return Err(ControllerError::InvalidBypassReason {
                            verification_id: id,
                            code,
                        });
                    }
                    let session = self.finish(calling_uid, id)?;
                    info!(verification_id = %id, %reason, "controller: verification bypassed");
                    session.callback.on_verification_bypassed_received(reason);
                    Ok(())
                });
                let _ = reply.send(result);
            }
        }
    }

    fn extend(
        &mut self,
        calling_uid: Uid,
        id: VerificationId,
        additional_ms: u64,
    ) -> Result<Extension, ControllerError> {
        let now = self.clock.now_ms();
        let session = self.session_for(calling_uid, id)?;
        session.callback.on_timeout_extension_requested();
        let extension = session.tracker.extend(additional_ms);
        let remaining = session.tracker.remaining_ms(now);
        debug!(
            verification_id = %id,
            requested_ms = additional_ms,
            granted_ms = extension.granted_ms,
            deadline_ms = extension.deadline_ms,
            "controller: timeout extended"
        );
        self.arm(TimerKey::Session(id), Duration::from_millis(remaining));
        Ok(extension)
    }

    fn finish(&mut self, calling_uid: Uid, id: VerificationId) -> Result<ActiveSession, ControllerError> {
        self.session_for(calling_uid, id)?;
        self.remove_session(id)
            .ok_or(ControllerError::SessionNotFound { verification_id: id })
    }

    // ── Experiments ──

    fn add_experiment(
        &mut self,
        package: String,
        policy: VerificationPolicy,
        outcomes: Vec<ExperimentOutcome>,
    ) -> bool {
        let key = TimerKey::ExperimentExpiry(package.clone());
        if self.experiments.add_experiment(&package, policy, outcomes) {
            self.arm(key, self.config.experiment_ttl());
            true
        } else {
            self.disarm(&key);
            false
        }
    }

    fn run_experiment(&mut self, package: &str, callback: &dyn VerifierCallback) -> bool {
        let ran = self.experiments.run_next_experiment(package, callback);
        let key = TimerKey::ExperimentExpiry(package.to_owned());
        if self.experiments.has_experiments(package) {
            self.arm(key, self.config.experiment_ttl());
        } else {
            self.disarm(&key);
        }
        ran
    }

    // ── Config / status ──

    fn reload_config(&mut self, config: ControllerConfig) {
        if config.verifier != self.config.verifier {
            info!(
                old = ?self.config.verifier.as_ref().map(|c| c.to_string()),
                new = ?config.verifier.as_ref().map(|c| c.to_string()),
                "controller: verifier changed, stale handles rebind on next use"
            );
        }
        self.config = config;
    }

    fn snapshot(&self) -> ControllerSnapshot {
        let mut handles: Vec<HandleInfo> = self
            .handles
            .iter()
            .map(|(user_id, h)| HandleInfo {
                user_id: *user_id,
                uid: h.uid,
                package_name: h.component.package_name.clone(),
                connected: h.connected,
                idle_disconnect_armed: self
                    .timer_keys
                    .contains_key(&TimerKey::AutoDisconnect(*user_id)),
            })
            .collect();
        handles.sort_by_key(|h| h.user_id);

        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                verification_id: *id,
                user_id: s.tracker.user_id(),
                package_name: s.package_name.clone(),
                dispatched_at_ms: s.tracker.dispatched_at_ms(),
                deadline_ms: s.tracker.deadline_ms(),
            })
            .collect();
        sessions.sort_by_key(|s| s.verification_id);

        let mut experiments: Vec<String> = self.experiments.packages().map(str::to_owned).collect();
        experiments.sort();

        ControllerSnapshot {
            verifier: self.config.verifier.clone(),
            handles,
            sessions,
            session_counts: self.session_counts.iter().map(|(u, c)| (*u, *c)).collect(),
            experiments,
        }
    }
}
