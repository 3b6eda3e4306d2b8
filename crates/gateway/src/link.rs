use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::TransportError;

pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_NORMAL: u16 = 1000;

/// Write half of a device transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError>;
}

/// Shared handle to a device's outbound side.
///
/// All writers go through one async mutex so concurrent command issuers and
/// the inbound router's error replies never interleave on the transport.
#[derive(Clone)]
pub struct DeviceLink {
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
}

impl DeviceLink {
    pub fn new(sink: impl FrameSink + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub async fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        self.sink.lock().await.send_text(text).await
    }

    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), TransportError> {
        self.sink.lock().await.close(code, reason.into()).await
    }
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink").finish_non_exhaustive()
    }
}
