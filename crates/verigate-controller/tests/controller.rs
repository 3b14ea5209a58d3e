use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use verigate_controller::{
    ControllerError, LifecycleSink, PackageResolver, RemoteVerifier, ServiceBinder, ServiceError,
    TokioClock, VerificationSession, VerifierController,
};
use verigate_core::callback::VerifierCallback;
use verigate_core::config::ControllerConfig;
use verigate_core::experiment::ExperimentOutcome;
use verigate_core::types::{
    BypassReason, ExtensionBundle, IncompleteReason, Uid, UserId, VerificationId,
    VerificationPolicy, VerificationRequest, VerificationStatus, VerifierComponent,
    VerifierRequest,
};

// ─── Fakes ────────────────────────────────────────────────────────

const START_MS: u64 = 1_700_000_000_000;
const VERIFIER_PKG: &str = "com.example.verifier";
const OTHER_VERIFIER_PKG: &str = "com.example.verifier2";
const VERIFIER_APP_ID: u32 = 10_123;
const USER0: UserId = UserId(0);
const USER10: UserId = UserId(10);

fn verifier_uid(user: UserId) -> Uid {
    Uid::of(user, VERIFIER_APP_ID)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    Ok,
    Fail,
    Hang,
}

#[derive(Default)]
struct BinderLog {
    binds: Vec<(UserId, String)>,
    unbinds: Vec<(UserId, String)>,
    posts: Vec<(UserId, VerifierRequest)>,
    sinks: Vec<LifecycleSink>,
    held: Vec<oneshot::Sender<Result<(), ServiceError>>>,
}

#[derive(Clone)]
struct FakeBinder {
    log: Arc<Mutex<BinderLog>>,
    ack: Arc<Mutex<Ack>>,
    auto_connect: bool,
}

impl FakeBinder {
    fn new() -> Self {
        Self {
            log: Arc::default(),
            ack: Arc::new(Mutex::new(Ack::Ok)),
            auto_connect: true,
        }
    }

    fn set_ack(&self, ack: Ack) {
        *self.ack.lock().unwrap() = ack;
    }

    fn binds(&self) -> Vec<(UserId, String)> {
        self.log.lock().unwrap().binds.clone()
    }

    fn unbinds(&self) -> Vec<(UserId, String)> {
        self.log.lock().unwrap().unbinds.clone()
    }

    fn posts(&self) -> Vec<(UserId, VerifierRequest)> {
        self.log.lock().unwrap().posts.clone()
    }

    fn sink(&self, index: usize) -> LifecycleSink {
        self.log.lock().unwrap().sinks[index].clone()
    }
}

struct FakeRemote {
    user_id: UserId,
    package: String,
    sink: LifecycleSink,
    binder: FakeBinder,
}

impl RemoteVerifier for FakeRemote {
    fn connect(&self) {
        if self.binder.auto_connect {
            self.sink.connected();
        }
    }

    fn post(&self, request: VerifierRequest) -> oneshot::Receiver<Result<(), ServiceError>> {
        let (tx, rx) = oneshot::channel();
        let ack = *self.binder.ack.lock().unwrap();
        let mut log = self.binder.log.lock().unwrap();
        log.posts.push((self.user_id, request));
        match ack {
            Ack::Ok => {
                let _ = tx.send(Ok(()));
            }
            Ack::Fail => {
                let _ = tx.send(Err(ServiceError::NotConnected));
            }
            Ack::Hang => log.held.push(tx),
        }
        rx
    }

    fn unbind(&self) {
        self.binder
            .log
            .lock()
            .unwrap()
            .unbinds
            .push((self.user_id, self.package.clone()));
    }
}

impl ServiceBinder for FakeBinder {
    fn bind(
        &self,
        component: &VerifierComponent,
        user_id: UserId,
        _uid: Uid,
        sink: LifecycleSink,
    ) -> Box<dyn RemoteVerifier> {
        {
            let mut log = self.log.lock().unwrap();
            log.binds.push((user_id, component.package_name.clone()));
            log.sinks.push(sink.clone());
        }
        Box::new(FakeRemote {
            user_id,
            package: component.package_name.clone(),
            sink,
            binder: self.clone(),
        })
    }
}

#[derive(Default)]
struct StaticResolver {
    installed: Mutex<HashMap<(String, UserId), Uid>>,
}

impl StaticResolver {
    fn install(&self, package: &str, user: UserId, uid: Uid) {
        self.installed
            .lock()
            .unwrap()
            .insert((package.to_string(), user), uid);
    }
}

impl PackageResolver for StaticResolver {
    fn package_uid(&self, package: &str, user_id: UserId) -> Option<Uid> {
        self.installed
            .lock()
            .unwrap()
            .get(&(package.to_string(), user_id))
            .copied()
    }
}

struct Recorder {
    events: Mutex<Vec<String>>,
    accept_policy: bool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Self::with_policy_acceptance(true)
    }

    fn with_policy_acceptance(accept_policy: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            accept_policy,
        })
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl VerifierCallback for Recorder {
    fn on_connection_established(&self) {
        self.push("established");
    }
    fn on_connection_failed(&self) {
        self.push("failed");
    }
    fn on_connection_infeasible(&self) {
        self.push("infeasible");
    }
    fn on_timeout_extension_requested(&self) {
        self.push("extension");
    }
    fn on_verification_policy_overridden(&self, policy: VerificationPolicy) -> bool {
        self.push(format!("policy:{policy}"));
        self.accept_policy
    }
    fn on_verification_incomplete_received(&self, reason: IncompleteReason) {
        self.push(format!("incomplete:{}", reason.code()));
    }
    fn on_verification_complete_received(
        &self,
        status: &VerificationStatus,
        extension_response: Option<&ExtensionBundle>,
    ) {
        let keys = extension_response.map(|b| b.len()).unwrap_or(0);
        self.push(format!("complete:{}:{keys}", status.verified));
    }
    fn on_verification_bypassed_received(&self, reason: BypassReason) {
        self.push(format!("bypassed:{}", reason.0));
    }
    fn on_timeout(&self) {
        self.push("timeout");
    }
}

// ─── Harness ──────────────────────────────────────────────────────

fn component(package: &str) -> VerifierComponent {
    VerifierComponent {
        package_name: package.to_string(),
        service_name: "VerifierService".to_string(),
    }
}

fn config() -> ControllerConfig {
    ControllerConfig::default().with_verifier(component(VERIFIER_PKG))
}

fn request(id: i32) -> VerificationRequest {
    VerificationRequest {
        verification_id: VerificationId(id),
        install_session_id: id,
        package_name: "com.example.app".to_string(),
        staged_package_uri: format!("file:///data/app/staged/{id}"),
        signing_info: Default::default(),
        declared_libraries: Vec::new(),
        extension_params: ExtensionBundle::new(),
        policy: VerificationPolicy::BlockFailClosed,
    }
}

struct Harness {
    controller: VerifierController,
    binder: FakeBinder,
    resolver: Arc<StaticResolver>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn harness_with(config: ControllerConfig, binder: FakeBinder) -> Harness {
    let resolver = Arc::new(StaticResolver::default());
    resolver.install(VERIFIER_PKG, USER0, verifier_uid(USER0));
    resolver.install(VERIFIER_PKG, USER10, verifier_uid(USER10));
    let cancel = CancellationToken::new();
    let (controller, task) = VerifierController::spawn(
        Arc::new(binder.clone()),
        resolver.clone(),
        Arc::new(TokioClock::anchored_at(START_MS)),
        config,
        cancel.clone(),
    );
    Harness {
        controller,
        binder,
        resolver,
        cancel,
        task,
    }
}

fn harness() -> Harness {
    harness_with(config(), FakeBinder::new())
}

/// Let the controller task and its helpers drain their queues.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

async fn start(h: &Harness, user: UserId, id: i32, callback: &Arc<Recorder>) {
    let started = h
        .controller
        .start_verification_session(user, request(id), callback.clone(), false)
        .await
        .unwrap();
    assert!(started);
    settle().await;
}

// ─── 1. Binding ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn no_verifier_configured_binds_nothing() {
    let h = harness_with(ControllerConfig::default(), FakeBinder::new());
    let cb = Recorder::new();

    assert!(!h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap());
    assert!(
        !h.controller
            .start_verification_session(USER0, request(1), cb.clone(), false)
            .await
            .unwrap()
    );
    settle().await;

    assert!(h.binder.binds().is_empty());
    assert!(h.binder.posts().is_empty());
    assert!(cb.events().is_empty());
    assert_eq!(h.controller.verifier_package_name().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn verifier_missing_for_user_binds_nothing() {
    let h = harness();
    let cb = Recorder::new();
    assert!(!h.controller.bind_to_verifier_service_if_needed(UserId(5), cb).await.unwrap());
    assert!(h.binder.binds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_bind_reuses_live_handle() {
    let h = harness();
    let cb = Recorder::new();

    assert!(h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap());
    assert!(h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap());
    settle().await;

    assert_eq!(h.binder.binds(), vec![(USER0, VERIFIER_PKG.to_string())]);
    assert_eq!(cb.count("established"), 1);
    assert_eq!(
        h.controller.verifier_uid_if_bound(USER0).await.unwrap(),
        Some(verifier_uid(USER0))
    );
    assert_eq!(h.controller.verifier_uid_if_bound(USER10).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn verifier_swap_unbinds_and_rebinds() {
    let h = harness();
    h.resolver.install(OTHER_VERIFIER_PKG, USER0, Uid::of(USER0, 10_200));
    let cb = Recorder::new();

    assert!(h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap());
    h.controller
        .reload_config(ControllerConfig::default().with_verifier(component(OTHER_VERIFIER_PKG)))
        .await
        .unwrap();
    assert!(h.binder.unbinds().is_empty(), "reload alone must not unbind");

    assert!(h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap());
    settle().await;

    assert_eq!(h.binder.unbinds(), vec![(USER0, VERIFIER_PKG.to_string())]);
    assert_eq!(
        h.binder.binds(),
        vec![
            (USER0, VERIFIER_PKG.to_string()),
            (USER0, OTHER_VERIFIER_PKG.to_string())
        ]
    );
    assert_eq!(
        h.controller.verifier_uid_if_bound(USER0).await.unwrap(),
        Some(Uid::of(USER0, 10_200))
    );
}

#[tokio::test(start_paused = true)]
async fn events_from_replaced_connection_are_ignored() {
    let h = harness();
    h.resolver.install(OTHER_VERIFIER_PKG, USER0, Uid::of(USER0, 10_200));
    let cb = Recorder::new();

    h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap();
    h.controller
        .reload_config(ControllerConfig::default().with_verifier(component(OTHER_VERIFIER_PKG)))
        .await
        .unwrap();
    h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap();
    settle().await;

    h.binder.sink(0).binder_died();
    settle().await;

    assert_eq!(
        h.controller.verifier_uid_if_bound(USER0).await.unwrap(),
        Some(Uid::of(USER0, 10_200))
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_reload_is_refused_and_old_config_kept() {
    let h = harness();
    let cb = Recorder::new();
    let bad = ControllerConfig {
        verification_request_timeout_ms: 0,
        ..config()
    };
    let err = h.controller.reload_config(bad).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidConfig(_)));

    let too_long = ControllerConfig {
        auto_disconnect_timeout_ms: u64::MAX,
        ..config()
    };
    assert!(matches!(
        h.controller.reload_config(too_long).await.unwrap_err(),
        ControllerError::InvalidConfig(_)
    ));

    start(&h, USER0, 30, &cb).await;
    assert_eq!(
        h.controller
            .get_timeout_time_millis(verifier_uid(USER0), VerificationId(30))
            .await
            .unwrap(),
        START_MS + 60_000
    );
    advance(60_000).await;
    assert_eq!(cb.count("timeout"), 1);
    assert!(!h.task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn oversized_timeouts_are_clamped_not_fatal() {
    let huge = ControllerConfig {
        verification_request_timeout_ms: u64::MAX,
        max_verification_request_extended_timeout_ms: u64::MAX,
        auto_disconnect_timeout_ms: u64::MAX,
        ..config()
    };
    let h = harness_with(huge, FakeBinder::new());
    let cb = Recorder::new();
    start(&h, USER0, 31, &cb).await;
    h.controller
        .report_verification_complete(verifier_uid(USER0), VerificationId(31), VerificationStatus::passed(), None)
        .await
        .unwrap();
    settle().await;

    let snapshot = h.controller.snapshot().await.unwrap();
    assert!(snapshot.sessions.is_empty());
    assert_eq!(cb.count("complete:true:0"), 1);
    assert!(!h.task.is_finished());
}

// ─── 2. Advisory notifications ────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn notifications_require_bound_verifier() {
    let h = harness();
    h.controller.notify_package_name_available("com.example.app", USER0);
    settle().await;
    assert!(h.binder.posts().is_empty());

    h.controller
        .bind_to_verifier_service_if_needed(USER0, Recorder::new())
        .await
        .unwrap();
    h.controller.notify_package_name_available("com.example.app", USER0);
    h.controller.notify_verification_cancelled("com.example.app", USER0);
    h.controller.notify_verification_timeout(VerificationId(9), USER0);
    settle().await;

    let methods: Vec<&str> = h.binder.posts().iter().map(|(_, r)| r.method()).collect();
    assert_eq!(
        methods,
        [
            "on_package_name_available",
            "on_verification_cancelled",
            "on_verification_timeout"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_notification_is_absorbed() {
    let h = harness();
    h.binder.set_ack(Ack::Fail);
    let cb = Recorder::new();
    h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap();
    h.controller.notify_verification_cancelled("com.example.app", USER0);
    settle().await;
    assert_eq!(cb.events(), ["established"]);
}

// ─── 3. Dispatch and timeout ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn dispatch_sends_required_or_retry() {
    let h = harness();
    let cb = Recorder::new();
    start(&h, USER0, 1, &cb).await;
    h.controller
        .start_verification_session(USER0, request(2), cb.clone(), true)
        .await
        .unwrap();
    settle().await;

    let posts = h.binder.posts();
    assert!(matches!(&posts[0].1, VerifierRequest::VerificationRequired(r) if r.verification_id == VerificationId(1)));
    assert!(matches!(&posts[1].1, VerifierRequest::VerificationRetry(r) if r.verification_id == VerificationId(2)));
    assert_eq!(h.controller.snapshot().await.unwrap().session_counts[&USER0], 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_once_at_default_deadline() {
    let h = harness();
    let cb = Recorder::new();
    start(&h, USER0, 100, &cb).await;

    let deadline = h
        .controller
        .get_timeout_time_millis(verifier_uid(USER0), VerificationId(100))
        .await
        .unwrap();
    assert_eq!(deadline, START_MS + 60_000);

    advance(59_999).await;
    assert_eq!(cb.count("timeout"), 0);
    advance(1).await;
    assert_eq!(cb.count("timeout"), 1);
    advance(120_000).await;
    assert_eq!(cb.count("timeout"), 1);

    let err = h
        .controller
        .get_timeout_time_millis(verifier_uid(USER0), VerificationId(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::SessionNotFound { .. }));
    assert!(h.controller.snapshot().await.unwrap().sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_dispatch_fails_connection() {
    let binder = FakeBinder::new();
    binder.set_ack(Ack::Hang);
    let h = harness_with(config(), binder);
    let cb = Recorder::new();
    start(&h, USER0, 3, &cb).await;

    advance(9_999).await;
    assert_eq!(cb.count("failed"), 0);
    advance(1).await;
    assert_eq!(cb.count("failed"), 1);

    advance(60_000).await;
    assert_eq!(cb.count("timeout"), 0, "a failed session must not also time out");
}

#[tokio::test(start_paused = true)]
async fn rejected_dispatch_fails_connection() {
    let binder = FakeBinder::new();
    binder.set_ack(Ack::Fail);
    let h = harness_with(config(), binder);
    let cb = Recorder::new();
    start(&h, USER0, 4, &cb).await;
    assert_eq!(cb.count("failed"), 1);
    assert!(h.controller.snapshot().await.unwrap().session_counts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn redispatching_same_id_does_not_double_count() {
    let h = harness();
    let cb = Recorder::new();
    start(&h, USER0, 5, &cb).await;
    start(&h, USER0, 5, &cb).await;
    let snapshot = h.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.session_counts[&USER0], 1);
}

#[tokio::test(start_paused = true)]
async fn default_deadline_is_capped_by_extension_limit() {
    let capped = ControllerConfig {
        verification_request_timeout_ms: 60_000,
        max_verification_request_extended_timeout_ms: 30_000,
        ..config()
    };
    let h = harness_with(capped, FakeBinder::new());
    let cb = Recorder::new();
    start(&h, USER0, 6, &cb).await;

    assert_eq!(
        h.controller
            .get_timeout_time_millis(verifier_uid(USER0), VerificationId(6))
            .await
            .unwrap(),
        START_MS + 30_000
    );
    advance(29_999).await;
    assert_eq!(cb.count("timeout"), 0);
    advance(1).await;
    assert_eq!(cb.count("timeout"), 1);
}

// ─── 4. Inbound calls ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn extension_is_relative_and_capped() {
    let h = harness();
    let cb = Recorder::new();
    let uid = verifier_uid(USER0);
    let id = VerificationId(200);
    start(&h, USER0, 200, &cb).await;

    let first = h.controller.extend_timeout_millis(uid, id, 60_000).await.unwrap();
    assert_eq!(first.granted_ms, 60_000);
    assert_eq!(first.deadline_ms, START_MS + 120_000);

    let second = h.controller.extend_timeout_millis(uid, id, 600_000).await.unwrap();
    assert_eq!(second.granted_ms, 480_000);
    assert_eq!(second.deadline_ms, START_MS + 600_000);
    assert_eq!(
        h.controller.get_timeout_time_millis(uid, id).await.unwrap(),
        START_MS + 600_000
    );
    assert_eq!(cb.count("extension"), 2);

    advance(599_999).await;
    assert_eq!(cb.count("timeout"), 0);
    advance(1).await;
    assert_eq!(cb.count("timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn extension_counts_from_current_deadline_not_now() {
    let h = harness();
    let cb = Recorder::new();
    let uid = verifier_uid(USER0);
    let id = VerificationId(201);
    start(&h, USER0, 201, &cb).await;

    advance(20_000).await;
    let ext = h.controller.extend_timeout_millis(uid, id, 300_000).await.unwrap();
    assert_eq!(ext.granted_ms, 300_000);
    assert_eq!(ext.deadline_ms, START_MS + 360_000);
    assert_eq!(h.controller.get_timeout_time_millis(uid, id).await.unwrap(), START_MS + 360_000);

    advance(339_999).await;
    assert_eq!(cb.count("timeout"), 0);
    advance(1).await;
    assert_eq!(cb.count("timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn second_report_is_rejected() {
    let h = harness();
    let cb = Recorder::new();
    let uid = verifier_uid(USER0);
    start(&h, USER0, 7, &cb).await;

    let mut response = ExtensionBundle::new();
    response.insert("risk".to_string(), serde_json::json!("low"));
    h.controller
        .report_verification_complete(uid, VerificationId(7), VerificationStatus::passed(), Some(response))
        .await
        .unwrap();
    let err = h
        .controller
        .report_verification_complete(uid, VerificationId(7), VerificationStatus::passed(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::SessionNotFound { verification_id } if verification_id == VerificationId(7)));
    let err = h
        .controller
        .report_verification_incomplete(uid, VerificationId(7), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::SessionNotFound { .. }));

    assert_eq!(cb.count("complete:true:1"), 1);
    advance(60_000).await;
    assert_eq!(cb.count("timeout"), 0);
}

#[tokio::test(start_paused = true)]
async fn incomplete_reason_is_validated() {
    let h = harness();
    let cb = Recorder::new();
    let uid = verifier_uid(USER0);
    start(&h, USER0, 8, &cb).await;

    for code in [-1, 2] {
        let err = h
            .controller
            .report_verification_incomplete(uid, VerificationId(8), code)
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }
    h.controller
        .report_verification_incomplete(uid, VerificationId(8), 1)
        .await
        .unwrap();
    assert_eq!(cb.count("incomplete:1"), 1);
}

#[tokio::test(start_paused = true)]
async fn bypass_reason_is_validated() {
    let h = harness();
    let cb = Recorder::new();
    let uid = verifier_uid(USER0);
    start(&h, USER0, 9, &cb).await;

    for code in [0, -5] {
        let err = h
            .controller
            .report_verification_bypassed(uid, VerificationId(9), code)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidBypassReason { code: c, .. } if c == code));
    }
    h.controller
        .report_verification_bypassed(uid, VerificationId(9), 200)
        .await
        .unwrap();
    assert_eq!(cb.count("bypassed:200"), 1);

    // Session lookup happens before the reason check.
    let err = h
        .controller
        .report_verification_bypassed(uid, VerificationId(9), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::SessionNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn caller_identity_is_enforced() {
    let h = harness();
    let cb = Recorder::new();
    start(&h, USER0, 10, &cb).await;

    let impostor = Uid::of(USER0, 10_999);
    let err = h
        .controller
        .report_verification_complete(impostor, VerificationId(10), VerificationStatus::passed(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::CallerNotVerifier { calling_uid } if calling_uid == impostor));
    assert!(err.is_identity_failure());

    let unbound = verifier_uid(USER10);
    let err = h
        .controller
        .assert_caller_is_current_verifier(unbound)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::VerifierDisconnected { user_id } if user_id == USER10));

    h.controller
        .assert_caller_is_current_verifier(verifier_uid(USER0))
        .await
        .unwrap();
    assert_eq!(cb.count("complete:true:0"), 0);
}

#[tokio::test(start_paused = true)]
async fn verifier_cannot_touch_other_users_sessions() {
    let h = harness();
    let cb = Recorder::new();
    h.controller
        .bind_to_verifier_service_if_needed(USER10, cb.clone())
        .await
        .unwrap();
    start(&h, USER0, 11, &cb).await;

    let err = h
        .controller
        .get_timeout_time_millis(verifier_uid(USER10), VerificationId(11))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::SessionNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn verification_session_caches_accepted_policy() {
    let h = harness();
    let accepting = Recorder::new();
    start(&h, USER0, 12, &accepting).await;
    let session = VerificationSession::new(h.controller.clone(), verifier_uid(USER0), request(12));

    assert_eq!(session.policy(), VerificationPolicy::BlockFailClosed);
    assert!(session.set_policy(VerificationPolicy::BlockFailClosed).await.unwrap());
    assert_eq!(accepting.count("policy:block_fail_closed"), 0);

    assert!(session.set_policy(VerificationPolicy::Warn).await.unwrap());
    assert_eq!(session.policy(), VerificationPolicy::Warn);
    assert_eq!(accepting.count("policy:warn"), 1);

    let granted = session.extend_timeout(Duration::from_secs(60)).await.unwrap();
    assert_eq!(granted, Duration::from_secs(60));
    assert_eq!(session.timeout_time().await.unwrap(), START_MS + 120_000);

    session.report_bypassed(BypassReason::TEST).await.unwrap();
    assert_eq!(accepting.count("bypassed:3"), 1);
}

#[tokio::test(start_paused = true)]
async fn verification_session_keeps_policy_on_rejection() {
    let h = harness();
    let rejecting = Recorder::with_policy_acceptance(false);
    start(&h, USER0, 13, &rejecting).await;
    let session = VerificationSession::new(h.controller.clone(), verifier_uid(USER0), request(13));

    assert!(!session.set_policy(VerificationPolicy::Open).await.unwrap());
    assert_eq!(session.policy(), VerificationPolicy::BlockFailClosed);

    session.report_incomplete(IncompleteReason::Unknown).await.unwrap();
    assert_eq!(rejecting.count("incomplete:0"), 1);
}

// ─── 5. Idle disconnect ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_connection_is_dropped() {
    let h = harness();
    h.controller
        .bind_to_verifier_service_if_needed(USER0, Recorder::new())
        .await
        .unwrap();
    settle().await;
    assert!(h.controller.snapshot().await.unwrap().handles[0].idle_disconnect_armed);

    advance(599_999).await;
    assert!(h.binder.unbinds().is_empty());
    advance(1).await;
    assert_eq!(h.binder.unbinds(), vec![(USER0, VERIFIER_PKG.to_string())]);
    assert_eq!(h.controller.verifier_uid_if_bound(USER0).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn live_session_holds_connection_per_user() {
    let h = harness();
    let cb = Recorder::new();
    h.controller
        .bind_to_verifier_service_if_needed(USER10, cb.clone())
        .await
        .unwrap();
    start(&h, USER0, 20, &cb).await;

    advance(30_000).await;
    h.controller
        .report_verification_complete(verifier_uid(USER0), VerificationId(20), VerificationStatus::passed(), None)
        .await
        .unwrap();
    settle().await;

    advance(570_000).await;
    assert_eq!(h.binder.unbinds(), vec![(USER10, VERIFIER_PKG.to_string())]);

    advance(30_000).await;
    assert_eq!(
        h.binder.unbinds(),
        vec![
            (USER10, VERIFIER_PKG.to_string()),
            (USER0, VERIFIER_PKG.to_string())
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn new_session_cancels_pending_idle_disconnect() {
    let h = harness();
    let cb = Recorder::new();
    h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap();
    settle().await;

    advance(500_000).await;
    start(&h, USER0, 21, &cb).await;
    h.controller
        .extend_timeout_millis(verifier_uid(USER0), VerificationId(21), 540_000)
        .await
        .unwrap();

    advance(200_000).await;
    assert!(h.binder.unbinds().is_empty());
}

// ─── 6. Connection loss ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn binder_death_fails_live_sessions() {
    let h = harness();
    let first = Recorder::new();
    let second = Recorder::new();
    start(&h, USER0, 30, &first).await;
    start(&h, USER0, 31, &second).await;

    h.binder.sink(0).binder_died();
    settle().await;

    assert_eq!(first.count("failed"), 1);
    assert_eq!(second.count("failed"), 1);
    assert_eq!(h.binder.unbinds().len(), 1);
    let snapshot = h.controller.snapshot().await.unwrap();
    assert!(snapshot.handles.is_empty());
    assert!(snapshot.sessions.is_empty());
    assert!(snapshot.session_counts.is_empty());

    advance(60_000).await;
    assert_eq!(first.count("timeout"), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_rebinds_on_next_session() {
    let h = harness();
    let cb = Recorder::new();
    h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap();
    settle().await;
    h.binder.sink(0).disconnected();
    settle().await;

    start(&h, USER0, 32, &cb).await;
    assert_eq!(h.binder.binds().len(), 2);
    assert_eq!(cb.count("established"), 2);
}

// ─── 7. Experiments ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn experiments_replay_in_order() {
    let h = harness();
    let cb = Recorder::new();
    let outcomes = ExperimentOutcome::parse_codes(&[1, 0, 4]);
    assert!(h.controller.add_experiment("com.example.app", VerificationPolicy::Warn, outcomes).await.unwrap());
    assert!(h.controller.has_experiments("com.example.app").await.unwrap());

    assert!(h.controller.start_local_experiment("com.example.app", cb.clone()).await.unwrap());
    assert!(h.controller.start_local_experiment("com.example.app", cb.clone()).await.unwrap());
    assert!(!h.controller.start_local_experiment("com.example.app", cb.clone()).await.unwrap());

    assert_eq!(
        cb.events(),
        ["policy:warn", "complete:true:0", "policy:warn", "incomplete:1"]
    );
    assert!(!h.controller.has_experiments("com.example.app").await.unwrap());
    assert!(h.binder.binds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn experiments_expire() {
    let h = harness();
    h.controller
        .add_experiment("com.example.app", VerificationPolicy::Open, vec![ExperimentOutcome::Timeout])
        .await
        .unwrap();

    advance(599_999).await;
    assert!(h.controller.has_experiments("com.example.app").await.unwrap());
    advance(1).await;
    assert!(!h.controller.has_experiments("com.example.app").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn empty_experiment_clears_previous() {
    let h = harness();
    h.controller
        .add_experiment("com.example.app", VerificationPolicy::Open, vec![ExperimentOutcome::Pass])
        .await
        .unwrap();
    assert!(
        !h.controller
            .add_experiment("com.example.app", VerificationPolicy::Open, Vec::new())
            .await
            .unwrap()
    );
    assert!(!h.controller.has_experiments("com.example.app").await.unwrap());
}

// ─── 8. Shutdown ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancel_unbinds_everything() {
    let h = harness();
    let cb = Recorder::new();
    h.controller.bind_to_verifier_service_if_needed(USER0, cb.clone()).await.unwrap();
    h.controller.bind_to_verifier_service_if_needed(USER10, cb.clone()).await.unwrap();

    h.cancel.cancel();
    h.task.await.unwrap();

    assert_eq!(h.binder.unbinds().len(), 2);
    let err = h.controller.snapshot().await.unwrap_err();
    assert!(matches!(err, ControllerError::ShutDown));
}
