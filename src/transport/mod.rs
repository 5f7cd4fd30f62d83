use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::protocol::{self, FrameError};

pub mod mock;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One open channel to a lockdown service: send a structured request, get a
/// structured reply. No retries live at this layer.
#[async_trait]
pub trait ServiceConnection: Send {
    async fn send_receive(&mut self, request: Value) -> Result<Value, TransportError>;
}

/// Service connection over a framed TCP stream.
pub struct TcpServiceConnection {
    stream: TcpStream,
}

impl TcpServiceConnection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl ServiceConnection for TcpServiceConnection {
    async fn send_receive(&mut self, request: Value) -> Result<Value, TransportError> {
        protocol::write_frame(&mut self.stream, &request).await?;
        Ok(protocol::read_frame(&mut self.stream).await?)
    }
}
