use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::heartbeat::{HeartbeatService, HeartbeatStatus, KeepAliveMonitor};
use crate::protocol::{AMFI_SERVICE_NAME, ActionRequest, ActionResponse, DevModeAction};
use crate::session::{LockdownSession, SessionError, SessionFactory};
use crate::transport::TransportError;

/// Exact error message the amfi service reports when a passcode blocks the
/// toggle. The string is the contract; keep the comparison in
/// [`is_passcode_set_error`] only.
pub const PASSCODE_SET_SENTINEL: &str = "Device has a passcode set";

fn is_passcode_set_error(message: &str) -> bool {
    message == PASSCODE_SET_SENTINEL
}

/// Cadence of the post-enable reconnection loop. The defaults cover a
/// typical reboot; both knobs are overridable. No backoff: the device's
/// reappearance time is usually small, so a fixed cadence keeps the worst
/// case bounded and the loop simple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 60,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum DevModeError {
    #[error("amfi service connection error: {0}")]
    Connection(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("device has a passcode set; remove it before enabling developer mode")]
    DeviceHasPasscodeSet,
    #[error("amfi service reported: {0}")]
    Amfi(String),
    #[error("developer mode request rejected: {response}")]
    EnableRejected { response: Value },
    #[error("create show-override-path file failed: {response}")]
    OverridePathRejected { response: Value },
    #[error("device did not reappear after {attempts} reconnect attempts")]
    ReconnectTimeout { attempts: u32 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("malformed amfi response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// Client for the developer-mode workflow on one device. Owns exactly one
/// lockdown session at a time; operations are not designed for concurrent
/// invocation and must be externally serialized.
pub struct AmfiClient {
    session: Box<dyn LockdownSession>,
    factory: Arc<dyn SessionFactory>,
    keep_alive: Arc<dyn KeepAliveMonitor>,
    retry: RetryPolicy,
    cancelled: Arc<AtomicBool>,
}

impl AmfiClient {
    pub fn new(session: Box<dyn LockdownSession>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            session,
            factory,
            keep_alive: Arc::new(HeartbeatService),
            retry: RetryPolicy::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_keep_alive(mut self, monitor: Arc<dyn KeepAliveMonitor>) -> Self {
        self.keep_alive = monitor;
        self
    }

    /// Shared flag that interrupts the reconnection loop. Checked once per
    /// iteration, before the inter-attempt delay.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn udid(&self) -> &str {
        self.session.udid()
    }

    /// Create the empty marker file at the device's show-override path
    /// (action 0).
    pub async fn create_show_override_path_file(&self) -> Result<(), DevModeError> {
        let (response, raw) = self.dispatch(DevModeAction::CreateShowOverridePath).await?;
        if !response.status {
            return Err(DevModeError::OverridePathRejected { response: raw });
        }
        Ok(())
    }

    /// Enable developer mode (action 1). The device reboots once it accepts
    /// the request; with `wait_for_restart` the call blocks until a fresh
    /// session is established, replacing the one held by this client.
    ///
    /// A reconnect timeout reports failure even though the device-side
    /// toggle may have succeeded; callers can re-run against the device once
    /// it reappears.
    ///
    /// The post-restart confirmation is never issued from here: the operator
    /// decides whether to accept the on-device prompt and calls
    /// [`confirm_post_restart`](Self::confirm_post_restart) separately.
    pub async fn enable_developer_mode(
        &mut self,
        wait_for_restart: bool,
    ) -> Result<(), DevModeError> {
        let udid = self.session.udid().to_string();
        let (response, raw) = self.dispatch(DevModeAction::Enable).await?;

        if let Some(message) = response.error.as_deref() {
            if is_passcode_set_error(message) {
                return Err(DevModeError::DeviceHasPasscodeSet);
            }
            return Err(DevModeError::Amfi(message.to_string()));
        }
        if !response.success {
            return Err(DevModeError::EnableRejected { response: raw });
        }
        if !wait_for_restart {
            return Ok(());
        }

        // Best effort: a dead keep-alive here just means the reboot already
        // started.
        match self.keep_alive.start(self.session.as_ref()).await {
            HeartbeatStatus::Alive => {}
            HeartbeatStatus::Disconnected => {
                debug!(udid, "device disconnected, awaiting reconnect");
            }
        }

        let fresh = self.await_reconnect(&udid).await?;
        self.session = fresh;
        Ok(())
    }

    /// Answer the prompt the device shows after its reboot (action 2).
    /// Intended as a separate, explicit operator step.
    pub async fn confirm_post_restart(&self) -> Result<(), DevModeError> {
        let (response, raw) = self.dispatch(DevModeAction::ConfirmPostRestart).await?;
        if !response.success {
            return Err(DevModeError::EnableRejected { response: raw });
        }
        Ok(())
    }

    /// One request/response round trip on a fresh amfi channel.
    async fn dispatch(&self, action: DevModeAction) -> Result<(ActionResponse, Value), DevModeError> {
        let mut channel = self.session.start_service(AMFI_SERVICE_NAME).await?;
        let request = serde_json::to_value(ActionRequest::new(action))?;
        let raw = channel.send_receive(request).await?;
        let response = ActionResponse::from_value(&raw)?;
        Ok((response, raw))
    }

    /// Poll the session factory until the device reappears or the retry
    /// budget runs out. Only errors classified as "device unreachable"
    /// continue the loop; anything else propagates immediately.
    async fn await_reconnect(&self, udid: &str) -> Result<Box<dyn LockdownSession>, DevModeError> {
        let RetryPolicy { max_retries, delay } = self.retry;
        for attempt in 0..=max_retries {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(DevModeError::Cancelled);
            }
            match self.factory.connect(udid).await {
                Ok(session) => {
                    info!(udid, attempt, "device reconnected");
                    return Ok(session);
                }
                Err(err) if err.is_device_unreachable() => {
                    warn!(
                        udid,
                        attempt,
                        max_retries,
                        error = %err,
                        "waiting for device to reappear"
                    );
                }
                Err(err) => return Err(err.into()),
            }
            sleep(delay).await;
        }
        Err(DevModeError::ReconnectTimeout {
            attempts: max_retries + 1,
        })
    }
}
