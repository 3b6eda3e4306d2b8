//! Turns one outbound command frame into a request/response exchange.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use shared::{
    domain::{CommandId, DeviceId, SYSTEM_TARGET},
    protocol::{CommandFrame, ProtocolError, ResponseFrame},
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    applier::SideEffectApplier,
    error::CommandError,
    registry::{ConnectionRegistry, DeviceEntry},
};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// What the issuer gets back when the device acknowledged the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub command_id: CommandId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct CommandCorrelator {
    registry: Arc<ConnectionRegistry>,
    applier: Arc<dyn SideEffectApplier>,
    timeout: Duration,
}

impl CommandCorrelator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        applier: Arc<dyn SideEffectApplier>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            applier,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn issue(
        &self,
        device_id: &DeviceId,
        target: &str,
        value: &str,
    ) -> Result<CommandReceipt, CommandError> {
        self.issue_with_timeout(device_id, target, value, self.timeout)
            .await
    }

    /// Sends `target`/`value` to the device and waits up to `timeout` for the
    /// correlated response.
    ///
    /// Exactly one of success, rejection, timeout, or connection loss is
    /// returned, and the pending entry is gone by the time this returns,
    /// including when the future is dropped early.
    pub async fn issue_with_timeout(
        &self,
        device_id: &DeviceId,
        target: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<CommandReceipt, CommandError> {
        let entry = self.registry.entry(device_id).inspect_err(|_| {
            warn!(%device_id, "command for device that is not connected");
        })?;

        let command_id = CommandId::generate();
        let (slot, mut response_rx) = oneshot::channel();
        let pending = PendingCommand::register(Arc::clone(&entry), command_id.clone(), slot)?;

        let frame = CommandFrame::new(command_id.clone(), target, value);
        if let Err(err) = entry.link.send_json(&frame).await {
            error!(%device_id, %command_id, error = %err, "failed to write command frame");
            return Err(CommandError::ConnectionLost);
        }
        info!(%device_id, %command_id, capability = target, value, "command sent");

        let response = match tokio::time::timeout(timeout, &mut response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                warn!(%device_id, %command_id, "connection lost while awaiting response");
                return Err(CommandError::ConnectionLost);
            }
            Err(_) => {
                if pending.withdraw() {
                    warn!(%device_id, %command_id, ?timeout, "command timed out");
                    return Err(CommandError::CommandTimeout);
                }
                // Claimed between the deadline and withdrawal. Whoever holds
                // the slot either sends on it or drops it.
                match response_rx.await {
                    Ok(response) => response,
                    Err(_) => {
                        warn!(%device_id, %command_id, "connection lost while awaiting response");
                        return Err(CommandError::ConnectionLost);
                    }
                }
            }
        };

        if !response.is_success() {
            warn!(
                %device_id,
                %command_id,
                status = %response.status,
                message = response.message.as_deref().unwrap_or_default(),
                "device rejected command"
            );
            return Err(CommandError::DeviceRejected(response.message));
        }

        if target == SYSTEM_TARGET {
            entry.state.lock().last_known_state = value.to_string();
        }
        if let Err(err) = self.applier.apply(device_id, target, value).await {
            error!(
                %device_id,
                %command_id,
                capability = target,
                value,
                error = %err,
                "failed to record command result"
            );
        }

        Ok(CommandReceipt {
            command_id,
            message: response.message,
        })
    }

    /// Hands `frame` to the command waiting on its id. The slot is removed
    /// and filled under the device lock, so a response can complete at most
    /// one waiter and a waiter that fails to withdraw always finds it.
    pub(crate) fn resolve(
        &self,
        entry: &DeviceEntry,
        frame: ResponseFrame,
    ) -> Result<(), ProtocolError> {
        let device_id = &entry.device_id;
        let command_id = frame.command_id.clone();
        let status = frame.status.clone();

        let delivered = {
            let mut state = entry.state.lock();
            let Some(slot) = state.pending.remove(&command_id) else {
                drop(state);
                warn!(%device_id, %command_id, "response for unknown command id");
                return Err(ProtocolError::UnknownCommandId);
            };
            slot.send(frame).is_ok()
        };

        info!(%device_id, %command_id, %status, "command response received");
        if !delivered {
            debug!(%device_id, %command_id, "command issuer went away before the response");
        }
        Ok(())
    }
}

/// Registration of one in-flight command. Dropping it removes the slot if it
/// is still pending.
struct PendingCommand {
    entry: Arc<DeviceEntry>,
    command_id: CommandId,
}

impl PendingCommand {
    fn register(
        entry: Arc<DeviceEntry>,
        command_id: CommandId,
        slot: oneshot::Sender<ResponseFrame>,
    ) -> Result<Self, CommandError> {
        {
            let mut state = entry.state.lock();
            if state.closed {
                return Err(CommandError::ConnectionLost);
            }
            state.pending.insert(command_id.clone(), slot);
        }
        Ok(Self { entry, command_id })
    }

    /// Returns true if the slot was still pending, i.e. nobody resolved it.
    fn withdraw(&self) -> bool {
        self.entry
            .state
            .lock()
            .pending
            .remove(&self.command_id)
            .is_some()
    }
}

impl Drop for PendingCommand {
    fn drop(&mut self) {
        self.withdraw();
    }
}

#[cfg(test)]
#[path = "tests/correlator_tests.rs"]
mod tests;
