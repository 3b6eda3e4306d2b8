use std::{convert::Infallible, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{domain::DeviceId, protocol::CommandFrame};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{DeviceLink, FrameSink, Gateway, SideEffectApplier, TransportError};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(String),
    Close(u16, String),
}

pub(crate) struct ChannelSink(mpsc::UnboundedSender<Outbound>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        self.0
            .send(Outbound::Close(code, reason))
            .map_err(|_| TransportError::Closed)
    }
}

pub(crate) fn channel_link() -> (DeviceLink, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeviceLink::new(ChannelSink(tx)), rx)
}

pub(crate) struct BrokenSink;

#[async_trait]
impl FrameSink for BrokenSink {
    async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
        Err(TransportError::Io("broken pipe".into()))
    }

    async fn close(&mut self, _code: u16, _reason: String) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }
}

#[derive(Default)]
pub(crate) struct RecordingApplier {
    pub(crate) applied: Mutex<Vec<(String, String, String)>>,
    pub(crate) offline: Mutex<Vec<String>>,
    pub(crate) fail: bool,
}

impl RecordingApplier {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SideEffectApplier for RecordingApplier {
    async fn apply(&self, device_id: &DeviceId, target: &str, value: &str) -> anyhow::Result<()> {
        self.applied
            .lock()
            .push((device_id.to_string(), target.to_string(), value.to_string()));
        if self.fail {
            anyhow::bail!("database unavailable");
        }
        Ok(())
    }

    async fn mark_offline(&self, device_id: &DeviceId) -> anyhow::Result<()> {
        self.offline.lock().push(device_id.to_string());
        if self.fail {
            anyhow::bail!("database unavailable");
        }
        Ok(())
    }
}

/// In-process stand-in for a field device attached to a gateway.
pub(crate) struct FakeDevice {
    pub(crate) device_id: DeviceId,
    inbound: Option<mpsc::UnboundedSender<Result<String, Infallible>>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    read_loop: JoinHandle<()>,
}

impl FakeDevice {
    pub(crate) fn connect(gateway: &Gateway, device_id: &str) -> Self {
        let device_id = DeviceId::new(device_id);
        let (link, outbound) = channel_link();
        let admission = gateway.admit(&device_id, link).expect("admit");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let serving = gateway.clone();
        let read_loop = tokio::spawn(async move {
            serving
                .serve(admission, UnboundedReceiverStream::new(inbound_rx))
                .await;
        });

        Self {
            device_id,
            inbound: Some(inbound_tx),
            outbound,
            read_loop,
        }
    }

    pub(crate) fn send(&self, frame: Value) {
        self.send_text(frame.to_string());
    }

    pub(crate) fn send_text(&self, text: impl Into<String>) {
        self.inbound
            .as_ref()
            .expect("device still connected")
            .send(Ok(text.into()))
            .expect("read loop alive");
    }

    pub(crate) async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("outbound frame in time")
            .expect("link open")
    }

    pub(crate) async fn next_command(&mut self) -> CommandFrame {
        match self.next_outbound().await {
            Outbound::Text(text) => serde_json::from_str(&text).expect("command frame"),
            other => panic!("expected command frame, got {other:?}"),
        }
    }

    pub(crate) async fn next_error(&mut self) -> String {
        match self.next_outbound().await {
            Outbound::Text(text) => {
                let value: Value = serde_json::from_str(&text).expect("json");
                value["error"].as_str().expect("error frame").to_string()
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    pub(crate) fn reply(&self, command: &CommandFrame, status: &str, message: Option<&str>) {
        let mut frame = serde_json::json!({
            "device_id": self.device_id.as_str(),
            "command_id": command.command_id.as_str(),
            "status": status,
        });
        if let Some(message) = message {
            frame["message"] = Value::from(message);
        }
        self.send(frame);
    }

    /// Closes the inbound side and waits for the read loop to finish its
    /// teardown.
    pub(crate) async fn hang_up(mut self) {
        self.inbound.take();
        tokio::time::timeout(WAIT, &mut self.read_loop)
            .await
            .expect("read loop exits")
            .expect("read loop task");
    }
}
