//! Device connection and command-correlation engine.
//!
//! One [`Gateway`] is built at startup and shared by the transport layer
//! (which admits connections and feeds their frames to [`Gateway::serve`]
//! together with the [`Admission`] it got back)
//! and by the control API (which calls [`Gateway::issue`]).

use std::{sync::Arc, time::Duration};

use futures::stream::BoxStream;
use shared::{
    domain::{DeviceId, SubscriberId},
    protocol::NotificationPayload,
};
use tracing::warn;

pub mod applier;
pub mod correlator;
pub mod error;
pub mod link;
pub mod notifications;
pub mod registry;
mod router;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use applier::SideEffectApplier;
pub use correlator::{CommandCorrelator, CommandReceipt, DEFAULT_COMMAND_TIMEOUT};
pub use error::{AdmitError, CommandError, TransportError};
pub use link::{DeviceLink, FrameSink, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
pub use notifications::NotificationHub;
pub use registry::{Admission, ConnectionRegistry};

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    registry: Arc<ConnectionRegistry>,
    correlator: CommandCorrelator,
    notifications: Arc<NotificationHub>,
    applier: Arc<dyn SideEffectApplier>,
}

impl Gateway {
    pub fn new(applier: Arc<dyn SideEffectApplier>, command_timeout: Duration) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator =
            CommandCorrelator::new(Arc::clone(&registry), Arc::clone(&applier), command_timeout);
        Self {
            inner: Arc::new(GatewayInner {
                registry,
                correlator,
                notifications: Arc::new(NotificationHub::new()),
                applier,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn correlator(&self) -> &CommandCorrelator {
        &self.inner.correlator
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.inner.notifications
    }

    pub(crate) fn applier(&self) -> &dyn SideEffectApplier {
        self.inner.applier.as_ref()
    }

    pub fn admit(&self, device_id: &DeviceId, link: DeviceLink) -> Result<Admission, AdmitError> {
        self.registry().admit(device_id, link)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.registry().connected_devices()
    }

    /// `None` when the device has no live connection.
    pub fn device_state(&self, device_id: &DeviceId) -> Option<String> {
        self.registry().last_known_state(device_id)
    }

    pub async fn issue(
        &self,
        device_id: &DeviceId,
        target: &str,
        value: &str,
    ) -> Result<CommandReceipt, CommandError> {
        self.correlator().issue(device_id, target, value).await
    }

    pub fn publish(&self, subscriber_id: &SubscriberId, payload: NotificationPayload) {
        self.notifications().publish(subscriber_id, payload);
    }

    pub fn stream(&self, subscriber_id: &SubscriberId) -> BoxStream<'static, NotificationPayload> {
        self.notifications().stream(subscriber_id)
    }

    /// Forcibly drops a device: pending commands fail with
    /// [`CommandError::ConnectionLost`] and the transport is asked to close,
    /// which ends its read loop. Does nothing if the device is not connected.
    pub async fn disconnect(&self, device_id: &DeviceId, reason: &str) -> bool {
        let Ok(link) = self.registry().lookup(device_id) else {
            return false;
        };
        let removed = self.registry().remove(device_id);
        if let Err(err) = link.close(CLOSE_NORMAL, reason).await {
            warn!(%device_id, error = %err, "failed to close device transport");
        }
        removed
    }
}
