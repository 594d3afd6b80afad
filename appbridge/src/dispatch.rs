//! Event fan-out and outbound command envelopes.
//!
//! Inbound update/health/register events are broadcast per app; every proxy
//! entity filters by unique id before applying. Each event is also mirrored
//! to the remote side of the channel as a `{namespace}/{kind}/{app}`
//! broadcast. Outbound commands are fire-and-forget: user-issued,
//! user-retriable, no ack.

use crate::entity::{AttrMap, Domain};
use crate::protocol::OutboundMessage;
use crate::session::SessionStatus;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Event kinds, matching the broadcast topic segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Register,
    Update,
    Health,
    Heartbeat,
    Shutdown,
}

/// Events broadcast to proxy entities subscribed to an app.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    EntityRegistered {
        unique_id: String,
        domain: Domain,
    },
    EntityUpdated {
        unique_id: String,
        data: AttrMap,
    },
    HealthChanged {
        unique_id: String,
        status: SessionStatus,
    },
    Shutdown,
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::EntityRegistered { .. } => EventKind::Register,
            BridgeEvent::EntityUpdated { .. } => EventKind::Update,
            BridgeEvent::HealthChanged { .. } => EventKind::Health,
            BridgeEvent::Shutdown => EventKind::Shutdown,
        }
    }

    /// The unique id this event is about, if it targets a single entity or
    /// session.
    pub fn unique_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::EntityRegistered { unique_id, .. }
            | BridgeEvent::EntityUpdated { unique_id, .. }
            | BridgeEvent::HealthChanged { unique_id, .. } => Some(unique_id),
            BridgeEvent::Shutdown => None,
        }
    }
}

/// Topic string for a broadcast event, `{namespace}/{event}/{app}`.
pub fn event_topic(namespace: &str, kind: EventKind, app: &str) -> String {
    format!("{namespace}/{kind}/{app}")
}

/// Mirrors an event as a broadcast message for the remote side.
pub fn broadcast(namespace: &str, app: &str, event: &BridgeEvent) -> OutboundMessage {
    let payload = match event {
        BridgeEvent::EntityRegistered { unique_id, domain } => json!({
            "unique_id": unique_id,
            "domain": domain,
        }),
        BridgeEvent::EntityUpdated { unique_id, data } => {
            let mut payload = serde_json::Map::new();
            payload.insert(
                "unique_id".to_owned(),
                Value::String(unique_id.clone()),
            );
            for (key, value) in data {
                payload.insert(
                    key.clone(),
                    serde_json::to_value(value).unwrap_or(Value::Null),
                );
            }
            Value::Object(payload)
        }
        BridgeEvent::HealthChanged { unique_id, status } => json!({
            "unique_id": unique_id,
            "status": status,
        }),
        BridgeEvent::Shutdown => json!({}),
    };

    OutboundMessage {
        topic: event_topic(namespace, event.kind(), app),
        payload,
    }
}

/// Builds the outbound envelope for a user-initiated command, addressed
/// `{namespace}/{command}/{app}` and carrying at least the unique id.
pub fn command(
    namespace: &str,
    app: &str,
    name: &str,
    unique_id: &str,
    args: &AttrMap,
) -> OutboundMessage {
    let mut payload = serde_json::Map::new();
    payload.insert(
        "unique_id".to_owned(),
        Value::String(unique_id.to_owned()),
    );
    for (key, value) in args {
        payload.insert(
            key.clone(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
    }

    OutboundMessage {
        topic: format!("{namespace}/{name}/{app}"),
        payload: Value::Object(payload),
    }
}

/// Publish/subscribe fabric keyed by app.
///
/// Subscribers that went away are pruned on the next publish to their app.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<BridgeEvent>>>,
}

impl EventBus {
    pub fn subscribe(&mut self, app: &str) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .entry(app.to_owned())
            .or_default()
            .push(sender);
        receiver
    }

    pub fn publish(&mut self, app: &str, event: BridgeEvent) {
        let Some(subscribers) = self.subscribers.get_mut(app) else {
            return;
        };

        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            self.subscribers.remove(app);
        }
    }
}

/// Fans every event out twice: to in-process subscribers and, mirrored as a
/// broadcast message, to the remote side of the channel.
#[derive(Debug)]
pub struct EventPublisher {
    namespace: String,
    bus: EventBus,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl EventPublisher {
    pub fn new(namespace: String, outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            namespace,
            bus: EventBus::default(),
            outbound,
        }
    }

    pub fn subscribe(&mut self, app: &str) -> mpsc::UnboundedReceiver<BridgeEvent> {
        self.bus.subscribe(app)
    }

    pub fn publish(&mut self, app: &str, event: BridgeEvent) {
        let _ = self.outbound.send(broadcast(&self.namespace, app, &event));
        self.bus.publish(app, event);
    }

    /// Liveness pings are relayed to the remote side only; in-process
    /// subscribers watch `HealthChanged` instead.
    pub fn heartbeat(&self, app: &str, unique_id: &str) {
        let message = OutboundMessage {
            topic: event_topic(&self.namespace, EventKind::Heartbeat, app),
            payload: json!({ "unique_id": unique_id }),
        };
        let _ = self.outbound.send(message);
    }
}
