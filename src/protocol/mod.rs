use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Lockdown service that owns the developer-mode toggle.
pub const AMFI_SERVICE_NAME: &str = "com.apple.amfi.lockdown";

/// Keep-alive service used to observe the reboot after enabling.
pub const HEARTBEAT_SERVICE_NAME: &str = "com.apple.mobile.heartbeat";

/// Upper bound on a single lockdown frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DevModeAction {
    CreateShowOverridePath = 0,
    Enable = 1,
    ConfirmPostRestart = 2,
}

impl DevModeAction {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Single-key action request understood by the amfi service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionRequest {
    pub action: u8,
}

impl ActionRequest {
    pub fn new(action: DevModeAction) -> Self {
        Self {
            action: action.code(),
        }
    }
}

/// Fields the amfi service replies with. `status` is only meaningful for the
/// override-path action, `success` for enable/confirm. The service reports
/// domain errors under the capitalised `Error` key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "Error", alias = "error")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one length-prefixed frame: 4-byte big-endian body length, then the
/// serialized body.
pub async fn write_frame<W, T>(writer: &mut W, body: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(body)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and parse the body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Value, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}
