use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{CommandId, DeviceId, SYSTEM_TARGET};

const FIELD_COMMAND_ID: &str = "command_id";
const FIELD_STATUS: &str = "status";
const FIELD_DESCRIPTION: &str = "description";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBody {
    pub target: String,
    pub value: String,
}

/// Outbound instruction written to a device connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: CommandBody,
    pub command_id: CommandId,
}

impl CommandFrame {
    pub fn new(command_id: CommandId, target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: CommandBody {
                target: target.into(),
                value: value.into(),
            },
            command_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub device_id: DeviceId,
    pub command_id: CommandId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseFrame {
    pub const SUCCESS: &'static str = "success";

    pub fn success(device_id: DeviceId, command_id: CommandId) -> Self {
        Self {
            device_id,
            command_id,
            status: Self::SUCCESS.to_string(),
            message: None,
        }
    }

    pub fn failure(device_id: DeviceId, command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            device_id,
            command_id,
            status: "failure".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub device_id: DeviceId,
    #[serde(rename = "service_type", alias = "category")]
    pub category: String,
    pub description: String,
    pub timestamp: String,
}

/// What a subscriber receives for each notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub category: String,
    pub description: String,
    pub timestamp: String,
}

impl NotificationPayload {
    pub fn device_disconnected(at: DateTime<Utc>) -> Self {
        Self {
            category: SYSTEM_TARGET.to_string(),
            description: "Device disconnected".to_string(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl From<NotificationFrame> for NotificationPayload {
    fn from(frame: NotificationFrame) -> Self {
        Self {
            category: frame.category,
            description: frame.description,
            timestamp: frame.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

/// Frame-level problems. None of them closes the connection; each is
/// answered inline with an [`ErrorFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid data")]
    InvalidData,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Invalid notification")]
    InvalidNotification,
    #[error("Device ID mismatch")]
    DeviceIdMismatch,
    #[error("Unknown command ID")]
    UnknownCommandId,
    #[error("Unrecognized frame")]
    UnrecognizedFrame,
}

impl ProtocolError {
    pub fn to_frame(self) -> ErrorFrame {
        ErrorFrame {
            error: self.to_string(),
        }
    }
}

/// A device-originated frame. The wire form carries no type tag, so the
/// variant is decided by which fields are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Notification(NotificationFrame),
}

impl InboundFrame {
    pub fn classify(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidData)?;
        let Some(object) = value.as_object() else {
            return Err(ProtocolError::InvalidData);
        };
        if object.is_empty() {
            return Err(ProtocolError::InvalidData);
        }

        if object.contains_key(FIELD_COMMAND_ID) && object.contains_key(FIELD_STATUS) {
            return serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|_| ProtocolError::InvalidResponse);
        }
        if object.contains_key(FIELD_DESCRIPTION) {
            return serde_json::from_value(value)
                .map(Self::Notification)
                .map_err(|_| ProtocolError::InvalidNotification);
        }
        Err(ProtocolError::UnrecognizedFrame)
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Response(frame) => &frame.device_id,
            Self::Notification(frame) => &frame.device_id,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
