use crate::device::DeviceDirectory;
use crate::entity::EntityDirectory;
use crate::protocol::ConfigurationSnapshot;
use crate::transport::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;
use tokio_util::time::delay_queue;

/// Connection status of one app session.
///
/// `Unregistered → Registered → Online ⇄ Offline → ShuttingDown`, where
/// `ShuttingDown` is terminal for that session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Unregistered,
    Registered,
    Online,
    Offline,
    ShuttingDown,
}

/// Session summary included in a successful register reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub unique_id: String,
    pub app_name: String,
    pub status: SessionStatus,
}

/// Read-only health view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHealth {
    pub unique_id: String,
    pub app_name: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_age_secs: Option<u64>,
}

/// State for one connected remote application.
///
/// Owned exclusively by the bridge event loop; all mutation is serialized
/// by that loop, so no locking is needed here.
#[derive(Debug)]
pub struct AppSession {
    pub unique_id: String,
    pub app_name: String,
    pub status: SessionStatus,
    /// Last-known content hash of the full configuration.
    pub config_hash: String,
    pub last_heartbeat_at: Option<Instant>,
    /// Key into the event loop's heartbeat delay queue while a deadline is
    /// armed. Taken when the deadline fires or the timer is canceled.
    pub heartbeat_timer: Option<delay_queue::Key>,
    pub configuration: Option<ConfigurationSnapshot>,
    pub connection: Option<ConnectionId>,
    pub devices: DeviceDirectory,
    pub entities: EntityDirectory,
}

impl AppSession {
    pub fn new(unique_id: String, app_name: String) -> Self {
        Self {
            unique_id,
            app_name,
            status: SessionStatus::Unregistered,
            config_hash: String::new(),
            last_heartbeat_at: None,
            heartbeat_timer: None,
            configuration: None,
            connection: None,
            devices: DeviceDirectory::default(),
            entities: EntityDirectory::default(),
        }
    }

    /// Returns true if the status actually changed.
    pub fn mark_online(&mut self) -> bool {
        if self.status == SessionStatus::Online {
            return false;
        }
        self.status = SessionStatus::Online;
        true
    }

    /// Idempotent: returns false if the session was already offline.
    pub fn mark_offline(&mut self) -> bool {
        if self.status == SessionStatus::Offline {
            return false;
        }
        self.status = SessionStatus::Offline;
        true
    }

    pub fn begin_shutdown(&mut self) {
        self.status = SessionStatus::ShuttingDown;
    }

    pub fn record_heartbeat(&mut self, at: Instant) {
        self.last_heartbeat_at = Some(at);
    }

    pub fn hash_drift(&self, reported: &str) -> bool {
        self.config_hash != reported
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            unique_id: self.unique_id.clone(),
            app_name: self.app_name.clone(),
            status: self.status,
        }
    }

    pub fn health(&self, now: Instant) -> SessionHealth {
        SessionHealth {
            unique_id: self.unique_id.clone(),
            app_name: self.app_name.clone(),
            status: self.status,
            last_heartbeat_age_secs: self
                .last_heartbeat_at
                .map(|at| now.duration_since(at).as_secs()),
        }
    }
}

/// All sessions tracked by the bridge, plus the connection→session index.
///
/// Exactly one session exists per unique id at a time. Shared only with the
/// event loop thread; handlers receive it by reference.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, AppSession>,
    by_connection: HashMap<ConnectionId, String>,
}

impl SessionRegistry {
    pub fn contains(&self, unique_id: &str) -> bool {
        self.sessions.contains_key(unique_id)
    }

    pub fn get(&self, unique_id: &str) -> Option<&AppSession> {
        self.sessions.get(unique_id)
    }

    pub fn get_mut(&mut self, unique_id: &str) -> Option<&mut AppSession> {
        self.sessions.get_mut(unique_id)
    }

    /// Resolves the session owning an inbound connection, if any.
    pub fn by_connection_mut(&mut self, connection: ConnectionId) -> Option<&mut AppSession> {
        let unique_id = self.by_connection.get(&connection)?;
        self.sessions.get_mut(unique_id)
    }

    pub fn insert(&mut self, session: AppSession) {
        self.sessions.insert(session.unique_id.clone(), session);
    }

    pub fn remove(&mut self, unique_id: &str) -> Option<AppSession> {
        self.by_connection.retain(|_, bound| bound != unique_id);
        self.sessions.remove(unique_id)
    }

    /// Binds a connection to a session, replacing any previous binding in
    /// either direction.
    pub fn bind(&mut self, connection: ConnectionId, unique_id: &str) {
        self.by_connection.retain(|_, bound| bound != unique_id);
        self.by_connection.insert(connection, unique_id.to_owned());
        if let Some(session) = self.sessions.get_mut(unique_id) {
            session.connection = Some(connection);
        }
    }

    /// Drops the binding for a closed connection. The affected session keeps
    /// running until its heartbeat deadline expires.
    pub fn unbind_connection(&mut self, connection: ConnectionId) {
        if let Some(unique_id) = self.by_connection.remove(&connection) {
            if let Some(session) = self.sessions.get_mut(&unique_id) {
                session.connection = None;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AppSession> {
        self.sessions.values_mut()
    }
}
