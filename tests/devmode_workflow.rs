use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devmode::amfi::{AmfiClient, DevModeError, PASSCODE_SET_SENTINEL, RetryPolicy};
use devmode::heartbeat::{HeartbeatStatus, KeepAliveMonitor};
use devmode::protocol::AMFI_SERVICE_NAME;
use devmode::session::{LockdownSession, SessionError, SessionFactory};
use devmode::transport::ServiceConnection;
use devmode::transport::mock::MockServiceConnection;
use serde_json::{Value, json};

const UDID: &str = "00008110-001A2B3C4D5E6F70";

#[derive(Clone)]
struct ScriptedSession {
    udid: String,
    replies: Arc<Mutex<Vec<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
    services: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSession {
    fn new(udid: &str, replies: Vec<Value>) -> Self {
        Self {
            udid: udid.to_string(),
            replies: Arc::new(Mutex::new(replies)),
            sent: Arc::new(Mutex::new(Vec::new())),
            services: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    fn services(&self) -> Vec<String> {
        self.services.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockdownSession for ScriptedSession {
    fn udid(&self) -> &str {
        &self.udid
    }

    async fn start_service(&self, name: &str) -> Result<Box<dyn ServiceConnection>, SessionError> {
        self.services.lock().unwrap().push(name.to_string());
        Ok(Box::new(MockServiceConnection::shared(
            self.replies.clone(),
            self.sent.clone(),
        )))
    }
}

enum ConnectOutcome {
    Transient,
    Fatal,
    Success,
}

/// Factory whose outcomes are scripted per call; once the script runs out it
/// keeps failing with a transient error, like a device that never comes
/// back. Records the udid of every call.
struct ScriptedFactory {
    script: Mutex<Vec<ConnectOutcome>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    fn new(script: Vec<ConnectOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn never_reachable() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(&self, udid: &str) -> Result<Box<dyn LockdownSession>, SessionError> {
        self.calls.lock().unwrap().push(udid.to_string());
        let mut script = self.script.lock().unwrap();
        let outcome = if script.is_empty() {
            ConnectOutcome::Transient
        } else {
            script.remove(0)
        };
        match outcome {
            ConnectOutcome::Transient => Err(SessionError::DeviceNotFound(udid.to_string())),
            ConnectOutcome::Fatal => {
                Err(SessionError::HandshakeRejected("pairing invalid".into()))
            }
            ConnectOutcome::Success => Ok(Box::new(ScriptedSession::new(udid, Vec::new()))),
        }
    }
}

/// Keep-alive stand-in reporting the reboot has already begun.
struct RebootingMonitor;

#[async_trait]
impl KeepAliveMonitor for RebootingMonitor {
    async fn start(&self, _session: &dyn LockdownSession) -> HeartbeatStatus {
        HeartbeatStatus::Disconnected
    }
}

fn client_with(session: &ScriptedSession, factory: Arc<ScriptedFactory>) -> AmfiClient {
    AmfiClient::new(Box::new(session.clone()), factory)
        .with_retry_policy(RetryPolicy {
            max_retries: 60,
            delay: Duration::ZERO,
        })
        .with_keep_alive(Arc::new(RebootingMonitor))
}

#[tokio::test]
async fn passcode_error_is_terminal_without_reconnect() {
    let session = ScriptedSession::new(UDID, vec![json!({ "Error": PASSCODE_SET_SENTINEL })]);
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());

    let err = client.enable_developer_mode(true).await.unwrap_err();
    assert!(matches!(err, DevModeError::DeviceHasPasscodeSet));
    assert!(factory.calls().is_empty());
}

#[tokio::test]
async fn other_amfi_errors_surface_verbatim() {
    let session = ScriptedSession::new(
        UDID,
        vec![json!({ "Error": "The operation couldn\u{2019}t be completed" })],
    );
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());

    let err = client.enable_developer_mode(true).await.unwrap_err();
    match err {
        DevModeError::Amfi(message) => {
            assert_eq!(message, "The operation couldn\u{2019}t be completed");
        }
        other => panic!("expected amfi error, got {other:?}"),
    }
    assert!(factory.calls().is_empty());
}

#[tokio::test]
async fn unsuccessful_enable_response_is_rejected() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": false })]);
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());

    let err = client.enable_developer_mode(true).await.unwrap_err();
    assert!(matches!(err, DevModeError::EnableRejected { .. }));
    assert!(factory.calls().is_empty());
}

#[tokio::test]
async fn empty_enable_response_is_rejected() {
    let session = ScriptedSession::new(UDID, vec![json!({})]);
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());

    let err = client.enable_developer_mode(true).await.unwrap_err();
    assert!(matches!(err, DevModeError::EnableRejected { .. }));
}

#[tokio::test]
async fn skipping_restart_wait_never_touches_the_factory() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": true })]);
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());

    client.enable_developer_mode(false).await.unwrap();
    assert!(factory.calls().is_empty());
    assert_eq!(session.sent(), vec![json!({ "action": 1 })]);
}

#[tokio::test]
async fn reconnect_succeeds_after_transient_failures() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": true })]);
    let factory = ScriptedFactory::new(vec![
        ConnectOutcome::Transient,
        ConnectOutcome::Transient,
        ConnectOutcome::Transient,
        ConnectOutcome::Success,
    ]);
    let mut client = client_with(&session, factory.clone());

    client.enable_developer_mode(true).await.unwrap();

    let calls = factory.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|udid| udid == UDID));
    // The fresh session replaced the pre-reboot one.
    assert_eq!(client.udid(), UDID);
}

#[tokio::test]
async fn reconnect_budget_exhausts_after_sixty_one_attempts() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": true })]);
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());

    let err = client.enable_developer_mode(true).await.unwrap_err();
    assert!(matches!(err, DevModeError::ReconnectTimeout { attempts: 61 }));
    assert_eq!(factory.calls().len(), 61);
}

#[tokio::test]
async fn permanent_factory_error_propagates_immediately() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": true })]);
    let factory = ScriptedFactory::new(vec![ConnectOutcome::Fatal]);
    let mut client = client_with(&session, factory.clone());

    let err = client.enable_developer_mode(true).await.unwrap_err();
    assert!(matches!(
        err,
        DevModeError::Session(SessionError::HandshakeRejected(_))
    ));
    assert_eq!(factory.calls().len(), 1);
}

#[tokio::test]
async fn cancellation_interrupts_the_reconnect_loop() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": true })]);
    let factory = ScriptedFactory::never_reachable();
    let mut client = client_with(&session, factory.clone());
    client.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);

    let err = client.enable_developer_mode(true).await.unwrap_err();
    assert!(matches!(err, DevModeError::Cancelled));
    assert!(factory.calls().is_empty());
}

#[tokio::test]
async fn override_path_success_requires_status() {
    let session = ScriptedSession::new(UDID, vec![json!({ "status": true })]);
    let client = client_with(&session, ScriptedFactory::never_reachable());

    client.create_show_override_path_file().await.unwrap();
    assert_eq!(session.services(), vec![AMFI_SERVICE_NAME.to_string()]);
    assert_eq!(session.sent(), vec![json!({ "action": 0 })]);
}

#[tokio::test]
async fn override_path_failure_carries_full_response() {
    let session = ScriptedSession::new(
        UDID,
        vec![json!({ "status": false, "detail": "filesystem sealed" })],
    );
    let client = client_with(&session, ScriptedFactory::never_reachable());

    let err = client.create_show_override_path_file().await.unwrap_err();
    match err {
        DevModeError::OverridePathRejected { response } => {
            assert_eq!(response["detail"], "filesystem sealed");
        }
        other => panic!("expected override path rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn confirm_checks_success_and_never_reconnects() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": true })]);
    let factory = ScriptedFactory::never_reachable();
    let client = client_with(&session, factory.clone());

    client.confirm_post_restart().await.unwrap();
    assert!(factory.calls().is_empty());
    assert_eq!(session.sent(), vec![json!({ "action": 2 })]);
}

#[tokio::test]
async fn confirm_rejection_never_reconnects_either() {
    let session = ScriptedSession::new(UDID, vec![json!({ "success": false, "Error": "denied" })]);
    let factory = ScriptedFactory::never_reachable();
    let client = client_with(&session, factory.clone());

    let err = client.confirm_post_restart().await.unwrap_err();
    assert!(matches!(err, DevModeError::EnableRejected { .. }));
    assert!(factory.calls().is_empty());
}
