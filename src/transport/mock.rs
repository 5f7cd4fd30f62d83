use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{ServiceConnection, TransportError};

/// Scripted service connection for tests: replies are consumed in order and
/// every request is recorded. An exhausted script behaves like a torn-down
/// connection.
pub struct MockServiceConnection {
    replies: Arc<Mutex<Vec<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl MockServiceConnection {
    pub fn scripted(replies: Vec<Value>) -> Self {
        Self::shared(
            Arc::new(Mutex::new(replies)),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    pub fn shared(replies: Arc<Mutex<Vec<Value>>>, sent: Arc<Mutex<Vec<Value>>>) -> Self {
        Self { replies, sent }
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceConnection for MockServiceConnection {
    async fn send_receive(&mut self, request: Value) -> Result<Value, TransportError> {
        self.sent.lock().unwrap().push(request);
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(TransportError::Closed);
        }
        Ok(replies.remove(0))
    }
}
