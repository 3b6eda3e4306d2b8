use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("device already connected")]
    DuplicateConnection,
}

/// Outcome of a command that did not succeed. Every variant is scoped to the
/// one command; none of them disconnects the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("device not connected")]
    NotConnected,
    #[error("timed out waiting for device response")]
    CommandTimeout,
    #[error("device connection lost before responding")]
    ConnectionLost,
    #[error("device rejected command: {}", .0.as_deref().unwrap_or("no reason given"))]
    DeviceRejected(Option<String>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Io(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
