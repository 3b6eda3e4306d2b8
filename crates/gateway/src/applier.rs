use anyhow::Result;
use async_trait::async_trait;
use shared::domain::DeviceId;

/// Persistence collaborator that records the effect of completed commands.
///
/// Implementations must make each call atomic: the state update and the
/// history append commit together or not at all.
#[async_trait]
pub trait SideEffectApplier: Send + Sync {
    /// Records a command the device acknowledged with `success`.
    async fn apply(&self, device_id: &DeviceId, target: &str, value: &str) -> Result<()>;

    /// Records that the device dropped its connection: every service is off.
    async fn mark_offline(&self, device_id: &DeviceId) -> Result<()>;
}
