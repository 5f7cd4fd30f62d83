use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::debug;

use crate::protocol::HEARTBEAT_SERVICE_NAME;
use crate::session::LockdownSession;

const DEFAULT_INTERVAL_SECS: u64 = 30;

/// Outcome of starting the keep-alive monitor. A torn-down connection is an
/// expected state here, not a failure: after the enable request the device
/// drops every session when it begins rebooting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Alive,
    Disconnected,
}

#[async_trait]
pub trait KeepAliveMonitor: Send + Sync {
    async fn start(&self, session: &dyn LockdownSession) -> HeartbeatStatus;
}

/// Keep-alive over the heartbeat service: one marco/polo exchange decides
/// the status, then a background task keeps answering until the connection
/// drops.
pub struct HeartbeatService;

#[async_trait]
impl KeepAliveMonitor for HeartbeatService {
    async fn start(&self, session: &dyn LockdownSession) -> HeartbeatStatus {
        let mut channel = match session.start_service(HEARTBEAT_SERVICE_NAME).await {
            Ok(channel) => channel,
            Err(err) => {
                debug!(udid = session.udid(), error = %err, "heartbeat service unavailable");
                return HeartbeatStatus::Disconnected;
            }
        };

        let interval = match channel.send_receive(json!({ "Command": "Polo" })).await {
            Ok(marco) => marco
                .get("Interval")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
            Err(err) => {
                debug!(udid = session.udid(), error = %err, "heartbeat connection torn down");
                return HeartbeatStatus::Disconnected;
            }
        };

        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(interval)).await;
                if let Err(err) = channel.send_receive(json!({ "Command": "Polo" })).await {
                    debug!(error = %err, "heartbeat loop ended");
                    break;
                }
            }
        });
        HeartbeatStatus::Alive
    }
}
