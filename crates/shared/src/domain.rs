use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(DeviceId);
id_newtype!(CommandId);
id_newtype!(SubscriberId);

impl CommandId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Device-originated notifications are delivered to the subscriber that owns
/// the device, which shares its identity.
impl From<&DeviceId> for SubscriberId {
    fn from(device_id: &DeviceId) -> Self {
        Self(device_id.0.clone())
    }
}

pub const SYSTEM_TARGET: &str = "system";

pub const SWITCH_FIELDS: [&str; 5] = [
    "system_status",
    "air_cond_service",
    "headlight_service",
    "drowsiness_service",
    "distance_service",
];

pub const NUMERIC_FIELDS: [&str; 3] = ["air_cond_temp", "headlight_brightness", "drowsiness_threshold"];

pub const CONTROL_TARGETS: [&str; 11] = [
    "air_cond_service",
    "drowsiness_service",
    "headlight_service",
    "distance_service",
    "temp_threshold",
    "humid_threshold",
    "distance_threshold",
    "lux_threshold",
    "drowsiness_threshold",
    SYSTEM_TARGET,
    "alarm_service",
];

pub fn is_control_target(target: &str) -> bool {
    CONTROL_TARGETS.contains(&target)
}

pub fn is_switch_value(value: &str) -> bool {
    matches!(value, "on" | "off")
}

/// Accepts `on`, `off`, `0`, or a positive number without a leading zero
/// (an optional fractional part is allowed).
pub fn is_command_value(value: &str) -> bool {
    if is_switch_value(value) || value == "0" {
        return true;
    }
    let (int_part, frac_part) = match value.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (value, None),
    };
    let mut int_chars = int_part.chars();
    let leading_ok = matches!(int_chars.next(), Some('1'..='9'));
    leading_ok
        && int_chars.all(|c| c.is_ascii_digit())
        && frac_part.map_or(true, |frac| frac.chars().all(|c| c.is_ascii_digit()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub service_type: String,
    pub description: String,
    pub timestamp: String,
}
