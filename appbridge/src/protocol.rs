use crate::device::DeviceInfo;
use crate::entity::{AttrMap, Domain, EntityDefinition};
use crate::session::{SessionHealth, SessionInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Absolute cap on any inbound message. Command classes without a tighter
/// cap of their own fall back to this one.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// The full decoded application metadata: devices plus all entity-domain
/// lists plus the content hash. Replaces a session's configuration
/// atomically, never partially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSnapshot {
    /// App name, used as the per-app namespace segment in event topics.
    pub app: String,
    pub title: String,
    /// Content hash over the configuration, as computed by the app.
    pub hash: String,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_devices: Vec<DeviceInfo>,
    pub hostname: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entities: BTreeMap<Domain, Vec<EntityDefinition>>,
}

/// Command classes, used for rate limiting and size caps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandClass {
    Register,
    Heartbeat,
    UpdateEntity,
    UpdateConfiguration,
    GoingOffline,
    GetHealth,
}

impl CommandClass {
    /// Calls admitted per connection per 60 second window, if limited.
    pub fn rate_limit(&self) -> Option<u32> {
        match self {
            CommandClass::Register => Some(10),
            CommandClass::Heartbeat => Some(120),
            CommandClass::UpdateEntity => Some(300),
            CommandClass::UpdateConfiguration => Some(5),
            CommandClass::GoingOffline | CommandClass::GetHealth => None,
        }
    }

    /// Per-command cap on the raw message size, if tighter than the
    /// absolute cap.
    pub fn size_cap(&self) -> Option<usize> {
        match self {
            CommandClass::Register => Some(50 * 1024),
            CommandClass::UpdateEntity => Some(10 * 1024),
            CommandClass::UpdateConfiguration => Some(MAX_MESSAGE_SIZE),
            CommandClass::Heartbeat | CommandClass::GoingOffline | CommandClass::GetHealth => None,
        }
    }
}

/// The part of the envelope needed before the payload may be parsed.
#[derive(Debug, Deserialize)]
pub(crate) struct Header {
    #[serde(default)]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: CommandClass,
}

/// Best-effort extraction of the correlation id from a malformed message.
#[derive(Debug, Deserialize)]
pub(crate) struct IdOnly {
    #[serde(default)]
    pub id: u64,
}

/// Inbound commands from a connected app, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    Register {
        unique_id: String,
        app_metadata: ConfigurationSnapshot,
    },
    Heartbeat {
        hash: String,
    },
    UpdateEntity {
        unique_id: String,
        changes: AttrMap,
    },
    UpdateConfiguration {
        configuration: ConfigurationSnapshot,
    },
    GoingOffline {
        unique_id: String,
    },
    GetHealth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unique_id: Option<String>,
    },
}

/// Error codes surfaced to the app in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessageFormat,
    BridgeNotFound,
    RateLimitExceeded,
    MessageTooLarge,
    ConfigurationTooLarge,
    RegistrationFailed,
    HeartbeatFailed,
    UpdateFailed,
    ConfigurationUpdateFailed,
    GoingOfflineFailed,
    InternalError,
}

/// Everything that can go wrong while handling an inbound request.
///
/// None of these crash the dispatcher; each is converted into a structured
/// error reply at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Malformed message: {0}")]
    InvalidMessageFormat(String),
    /// The session or connection is unknown. Transient: the caller may retry
    /// once the owning configuration entry exists.
    #[error("No bridge session matches the request")]
    BridgeNotFound,
    #[error(transparent)]
    RateLimitExceeded(#[from] throttle::RateLimitExceeded),
    #[error("Message of {got} bytes exceeds the {cap} byte cap")]
    MessageTooLarge { got: usize, cap: usize },
    #[error("Configuration of {got} bytes exceeds the {cap} byte cap")]
    ConfigurationTooLarge { got: usize, cap: usize },
    #[error("Registration failed")]
    RegistrationFailed(#[source] anyhow::Error),
    #[error("Heartbeat failed")]
    HeartbeatFailed(#[source] anyhow::Error),
    #[error("Entity update failed")]
    UpdateFailed(#[source] anyhow::Error),
    #[error("Configuration update failed")]
    ConfigurationUpdateFailed(#[source] anyhow::Error),
    #[error("Going-offline failed")]
    GoingOfflineFailed(#[source] anyhow::Error),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::InvalidMessageFormat(_) => ErrorCode::InvalidMessageFormat,
            BridgeError::BridgeNotFound => ErrorCode::BridgeNotFound,
            BridgeError::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            BridgeError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            BridgeError::ConfigurationTooLarge { .. } => ErrorCode::ConfigurationTooLarge,
            BridgeError::RegistrationFailed(_) => ErrorCode::RegistrationFailed,
            BridgeError::HeartbeatFailed(_) => ErrorCode::HeartbeatFailed,
            BridgeError::UpdateFailed(_) => ErrorCode::UpdateFailed,
            BridgeError::ConfigurationUpdateFailed(_) => ErrorCode::ConfigurationUpdateFailed,
            BridgeError::GoingOfflineFailed(_) => ErrorCode::GoingOfflineFailed,
        }
    }
}

/// Reply to an inbound command, echoing the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_drift_detected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Vec<SessionHealth>>,
}

impl Reply {
    pub fn success(id: u64) -> Self {
        Self {
            id,
            success: true,
            code: None,
            message: None,
            hash_drift_detected: None,
            session: None,
            health: None,
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: String) -> Self {
        Self {
            id,
            success: false,
            code: Some(code),
            message: Some(message),
            hash_drift_detected: None,
            session: None,
            health: None,
        }
    }

    pub fn with_drift(mut self, drift: bool) -> Self {
        self.hash_drift_detected = Some(drift);
        self
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_health(mut self, health: Vec<SessionHealth>) -> Self {
        self.health = Some(health);
        self
    }
}

/// A message for the remote side of the channel: broadcast events and
/// fire-and-forget commands, addressed by topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    /// Broadcast asking the app to identify itself with a full snapshot.
    pub fn discovery(app: &str) -> Self {
        Self {
            topic: format!("discovery/{app}"),
            payload: serde_json::json!({}),
        }
    }
}
