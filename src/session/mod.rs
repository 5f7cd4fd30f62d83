use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::{self, FrameError};
use crate::transport::{ServiceConnection, TcpServiceConnection};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no device found with udid {0}")]
    DeviceNotFound(String),
    #[error("connection to device failed: {0}")]
    ConnectionFailed(String),
    #[error("malformed lockdown stream: {0}")]
    MalformedStream(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lockdown handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },
}

impl SessionError {
    /// Error kinds expected while a device is rebooting or re-enumerating.
    /// Only these are retried by the reconnection loop; everything else is a
    /// permanent failure.
    pub fn is_device_unreachable(&self) -> bool {
        matches!(
            self,
            SessionError::DeviceNotFound(_)
                | SessionError::ConnectionFailed(_)
                | SessionError::MalformedStream(_)
                | SessionError::Io(_)
        )
    }
}

/// An established lockdown session to one device. Owned exclusively by its
/// consumer; a replacement session is obtained from a [`SessionFactory`].
#[async_trait]
pub trait LockdownSession: Send + Sync {
    fn udid(&self) -> &str;

    /// Open a fresh channel to a named lockdown service.
    async fn start_service(&self, name: &str) -> Result<Box<dyn ServiceConnection>, SessionError>;
}

/// Establishes fresh sessions for a device identifier. Fails while the
/// device is unreachable.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, udid: &str) -> Result<Box<dyn LockdownSession>, SessionError>;
}

#[derive(Serialize)]
struct HelloRequest<'a> {
    request: &'static str,
    udid: &'a str,
}

#[derive(Deserialize)]
struct HelloResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct StartServiceRequest<'a> {
    request: &'static str,
    udid: &'a str,
    service: &'a str,
}

#[derive(Deserialize)]
struct StartServiceResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Session factory backed by a TCP lockdown endpoint.
pub struct TcpSessionFactory {
    addr: String,
}

impl TcpSessionFactory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn connect(&self, udid: &str) -> Result<Box<dyn LockdownSession>, SessionError> {
        let mut stream = open_stream(&self.addr).await?;
        protocol::write_frame(
            &mut stream,
            &HelloRequest {
                request: "Hello",
                udid,
            },
        )
        .await
        .map_err(stream_error)?;
        let value = protocol::read_frame(&mut stream).await.map_err(stream_error)?;
        let response: HelloResponse = serde_json::from_value(value)
            .map_err(|err| SessionError::MalformedStream(err.to_string()))?;
        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "device refused session".to_string());
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("no device") || lowered.contains("not found") {
                return Err(SessionError::DeviceNotFound(udid.to_string()));
            }
            return Err(SessionError::HandshakeRejected(message));
        }
        debug!(udid, addr = %self.addr, "lockdown session established");
        Ok(Box::new(TcpLockdownSession {
            udid: udid.to_string(),
            addr: self.addr.clone(),
        }))
    }
}

/// Lockdown session over TCP. Each service channel is its own connection so
/// one session can hand out channels without serializing them.
pub struct TcpLockdownSession {
    udid: String,
    addr: String,
}

#[async_trait]
impl LockdownSession for TcpLockdownSession {
    fn udid(&self) -> &str {
        &self.udid
    }

    async fn start_service(&self, name: &str) -> Result<Box<dyn ServiceConnection>, SessionError> {
        let mut stream = open_stream(&self.addr).await?;
        protocol::write_frame(
            &mut stream,
            &StartServiceRequest {
                request: "StartService",
                udid: &self.udid,
                service: name,
            },
        )
        .await
        .map_err(stream_error)?;
        let value = protocol::read_frame(&mut stream).await.map_err(stream_error)?;
        let response: StartServiceResponse = serde_json::from_value(value)
            .map_err(|err| SessionError::MalformedStream(err.to_string()))?;
        if !response.success {
            return Err(SessionError::ServiceUnavailable {
                service: name.to_string(),
                reason: response
                    .message
                    .unwrap_or_else(|| "service refused".to_string()),
            });
        }
        debug!(udid = %self.udid, service = name, "service channel opened");
        Ok(Box::new(TcpServiceConnection::new(stream)))
    }
}

async fn open_stream(addr: &str) -> Result<TcpStream, SessionError> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(SessionError::ConnectionFailed(err.to_string())),
        Err(_) => Err(SessionError::ConnectionFailed(format!(
            "connect to {addr} timed out"
        ))),
    }
}

fn stream_error(err: FrameError) -> SessionError {
    match err {
        FrameError::Io(source) => SessionError::Io(source),
        other => SessionError::MalformedStream(other.to_string()),
    }
}
