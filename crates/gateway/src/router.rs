//! Read loop for one admitted device connection.

use std::{fmt::Display, sync::Arc};

use chrono::Utc;
use futures::{Stream, StreamExt};
use shared::{
    domain::SubscriberId,
    protocol::{InboundFrame, NotificationPayload, ProtocolError},
};
use tracing::{error, info, warn};

use crate::{
    registry::{Admission, DeviceEntry},
    Gateway,
};

impl Gateway {
    /// Routes every frame read from the admitted connection until the
    /// transport closes, then tears that connection down.
    ///
    /// Frame-level problems are answered inline and never end the loop.
    pub async fn serve<S, E>(&self, admission: Admission, frames: S)
    where
        S: Stream<Item = Result<String, E>>,
        E: Display,
    {
        let entry = admission.entry;
        let device_id = &entry.device_id;

        futures::pin_mut!(frames);
        while let Some(next) = frames.next().await {
            match next {
                Ok(text) => self.route(&entry, &text).await,
                Err(err) => {
                    warn!(%device_id, error = %err, "device transport failed");
                    break;
                }
            }
        }

        info!(%device_id, "device disconnected");
        self.teardown(&entry).await;
    }

    async fn route(&self, entry: &DeviceEntry, text: &str) {
        let device_id = &entry.device_id;
        let outcome = InboundFrame::classify(text).and_then(|frame| {
            if frame.device_id() != device_id {
                return Err(ProtocolError::DeviceIdMismatch);
            }
            match frame {
                InboundFrame::Response(response) => self.correlator().resolve(entry, response),
                InboundFrame::Notification(notification) => {
                    info!(
                        %device_id,
                        category = %notification.category,
                        description = %notification.description,
                        "device notification"
                    );
                    self.notifications()
                        .publish(&SubscriberId::from(device_id), notification.into());
                    Ok(())
                }
            }
        });

        if let Err(problem) = outcome {
            warn!(%device_id, %problem, "rejected device frame");
            if let Err(err) = entry.link.send_json(&problem.to_frame()).await {
                error!(%device_id, error = %err, "failed to send error frame");
            }
        }
    }

    /// Unblocks every waiter with a lost connection, drops the registry
    /// entry, tells the owner, and records the device as off. Skips the
    /// side effects when the device has already reconnected.
    pub(crate) async fn teardown(&self, entry: &Arc<DeviceEntry>) {
        let device_id = &entry.device_id;
        if !self.registry().remove_entry(entry) && self.registry().is_connected(device_id) {
            info!(%device_id, "stale read loop ended after reconnect");
            return;
        }

        self.notifications().publish(
            &SubscriberId::from(device_id),
            NotificationPayload::device_disconnected(Utc::now()),
        );

        if let Err(err) = self.applier().mark_offline(device_id).await {
            error!(%device_id, error = %err, "failed to record device disconnect");
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
