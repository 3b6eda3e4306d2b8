//! WebSocket transport for field devices.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{
    future,
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use gateway::{DeviceLink, FrameSink, TransportError, CLOSE_POLICY_VIOLATION};
use shared::domain::DeviceId;
use tracing::{error, warn};

use crate::app_state::AppState;

const CLOSE_INTERNAL_ERROR: u16 = 1011;

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

/// Text frames until the peer sends a close frame. Pings and pongs are
/// answered by axum and never reach the gateway.
fn text_frames(
    receiver: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String, axum::Error>> {
    receiver
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
        })
}

pub(crate) async fn device_connection(state: Arc<AppState>, socket: WebSocket, device_id: DeviceId) {
    let (sender, receiver) = socket.split();
    let link = DeviceLink::new(WsSink(sender));

    match state.storage.device_exists(&device_id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(%device_id, "rejected connection from unregistered device");
            close_quietly(&link, CLOSE_POLICY_VIOLATION, "Device not registered").await;
            return;
        }
        Err(err) => {
            error!(%device_id, error = %err, "failed to look up device identity");
            close_quietly(&link, CLOSE_INTERNAL_ERROR, "Internal server error").await;
            return;
        }
    }

    let Ok(admission) = state.gateway.admit(&device_id, link.clone()) else {
        close_quietly(&link, CLOSE_POLICY_VIOLATION, "Device already connected").await;
        return;
    };

    state.gateway.serve(admission, text_frames(receiver)).await;
}

async fn close_quietly(link: &DeviceLink, code: u16, reason: &str) {
    if let Err(err) = link.close(code, reason).await {
        warn!(error = %err, "failed to send close frame");
    }
}
