#![allow(dead_code)]

use appbridge::device::InMemoryDeviceRegistry;
use appbridge::entity::InMemoryEntityRegistry;
use appbridge::env::{GetConfig, Testing};
use appbridge::protocol::{OutboundMessage, Reply};
use appbridge::transport::{ConnectionId, Inbound};
use appbridge::{BridgeChannels, BridgeEventLoop, BridgeHandle};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub const NAMESPACE: &str = "homelink";

pub struct Bridge {
    pub handle: BridgeHandle,
    pub requests: mpsc::Sender<Inbound>,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    pub devices: Arc<InMemoryDeviceRegistry>,
    pub entities: Arc<InMemoryEntityRegistry>,
}

/// Spawns a bridge with one pre-configured app.
pub async fn bridge_with_app(unique_id: &str, app: &str) -> Bridge {
    let devices = Arc::new(InMemoryDeviceRegistry::default());
    let entities = Arc::new(InMemoryEntityRegistry::default());

    let (event_loop, handle, BridgeChannels { requests, outbound }) = BridgeEventLoop::new(
        Testing::get_config(),
        NAMESPACE.to_owned(),
        devices.clone(),
        entities.clone(),
    );
    tokio::spawn(event_loop.run());

    handle
        .add_app(unique_id.to_owned(), app.to_owned())
        .await
        .unwrap();

    Bridge {
        handle,
        requests,
        outbound,
        devices,
        entities,
    }
}

impl Bridge {
    pub async fn request(&self, connection: u64, body: Value) -> Reply {
        let (responder, reply) = oneshot::channel();
        self.requests
            .send(Inbound::Request {
                connection: ConnectionId(connection),
                body: body.to_string(),
                responder,
            })
            .await
            .unwrap();
        reply.await.unwrap()
    }

    pub async fn identify(&self, app: &str, payload: String) {
        self.requests
            .send(Inbound::Identify {
                app: app.to_owned(),
                payload,
            })
            .await
            .unwrap();
    }

    pub async fn disconnect(&self, connection: u64) {
        self.requests
            .send(Inbound::Disconnected {
                connection: ConnectionId(connection),
            })
            .await
            .unwrap();
    }

    /// Reads outbound messages, skipping broadcast mirrors, until one with
    /// the given topic arrives.
    pub async fn outbound_until(&mut self, topic: &str) -> OutboundMessage {
        loop {
            let message = self.outbound.recv().await.expect("outbound channel closed");
            if message.topic == topic {
                return message;
            }
        }
    }
}

/// A snapshot with one sensor per id, all hanging off one primary device.
pub fn metadata(hash: &str, sensors: &[&str]) -> Value {
    json!({
        "app": "workstation",
        "title": "Workstation Agent",
        "hash": hash,
        "device": { "unique_id": "dev-1", "name": "Workstation" },
        "hostname": "box",
        "username": "user",
        "entities": {
            "sensor": sensors
                .iter()
                .map(|id| json!({ "unique_id": id, "name": id, "native_value": 1.0 }))
                .collect::<Vec<_>>()
        }
    })
}

pub fn register(id: u64, unique_id: &str, hash: &str, sensors: &[&str]) -> Value {
    json!({
        "id": id,
        "type": "register",
        "unique_id": unique_id,
        "app_metadata": metadata(hash, sensors)
    })
}

pub fn heartbeat(id: u64, hash: &str) -> Value {
    json!({ "id": id, "type": "heartbeat", "hash": hash })
}
