use crate::codec;
use crate::device::DeviceRegistry;
use crate::dispatch::{self, BridgeEvent, EventPublisher};
use crate::entity::{AttrMap, EntityRecord, EntityRegistry};
use crate::env;
use crate::protocol::{
    BridgeError, CommandClass, ConfigurationSnapshot, Header, IdOnly, InboundCommand,
    OutboundMessage, Reply, MAX_MESSAGE_SIZE,
};
use crate::session::{AppSession, SessionHealth, SessionRegistry, SessionStatus};
use crate::transport::{BridgeChannels, ConnectionId, Inbound};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::time::DelayQueue;

/// Outcome of one identify round, fed back into the select loop.
type ReloadOutcome = (String, String, Option<ConfigurationSnapshot>);

/// The single task that owns all session state.
///
/// Every inbound request, timer expiry and host command is serialized
/// through `run`, so handlers mutate sessions without locks. Reloads are the
/// only long-running work; they execute as in-flight futures and report back
/// through the loop instead of blocking it.
pub struct BridgeEventLoop {
    env_config: env::Config,
    namespace: String,
    registry: SessionRegistry,
    rate_limiter: throttle::SlidingWindow<(ConnectionId, CommandClass)>,
    device_registry: Arc<dyn DeviceRegistry>,
    entity_registry: Arc<dyn EntityRegistry>,
    events: EventPublisher,
    /// One armed deadline per session that owes us a heartbeat.
    heartbeats: DelayQueue<String>,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    commands: mpsc::Receiver<HandleCommand>,
    /// Identify payloads are routed to the reload that asked for them, keyed
    /// by app. At most one reload per app is in flight.
    pending_identify: HashMap<String, mpsc::UnboundedSender<String>>,
    inflight_reloads: FuturesUnordered<BoxFuture<'static, ReloadOutcome>>,
}

enum HandleCommand {
    AddApp {
        unique_id: String,
        app_name: String,
        done: oneshot::Sender<()>,
    },
    RemoveApp {
        unique_id: String,
        done: oneshot::Sender<bool>,
    },
    SendCommand {
        app: String,
        command: String,
        unique_id: String,
        args: AttrMap,
    },
    GetHealth {
        unique_id: Option<String>,
        reply: oneshot::Sender<Vec<SessionHealth>>,
    },
    Entity {
        unique_id: String,
        reply: oneshot::Sender<Option<(EntityRecord, SessionStatus)>>,
    },
    Subscribe {
        app: String,
        reply: oneshot::Sender<mpsc::UnboundedReceiver<BridgeEvent>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

impl BridgeEventLoop {
    pub fn new(
        env_config: env::Config,
        namespace: String,
        device_registry: Arc<dyn DeviceRegistry>,
        entity_registry: Arc<dyn EntityRegistry>,
    ) -> (Self, BridgeHandle, BridgeChannels) {
        let (inbound_sender, inbound_receiver) = mpsc::channel(64);
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let (command_sender, command_receiver) = mpsc::channel(16);

        let event_loop = Self {
            rate_limiter: throttle::SlidingWindow::new(env_config.rate_window),
            env_config,
            events: EventPublisher::new(namespace.clone(), outbound_sender.clone()),
            namespace,
            registry: SessionRegistry::default(),
            device_registry,
            entity_registry,
            heartbeats: DelayQueue::new(),
            inbound: inbound_receiver,
            outbound: outbound_sender,
            commands: command_receiver,
            pending_identify: HashMap::new(),
            inflight_reloads: FuturesUnordered::new(),
        };
        let handle = BridgeHandle {
            commands: command_sender,
        };
        let channels = BridgeChannels {
            requests: inbound_sender,
            outbound: outbound_receiver,
        };

        (event_loop, handle, channels)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                inbound = self.inbound.recv() => {
                    match inbound {
                        Some(Inbound::Request { connection, body, responder }) => {
                            let (reply, reload) = self.handle_request(connection, &body).await;
                            let _ = responder.send(reply);
                            if let Some(unique_id) = reload {
                                self.begin_reload(&unique_id);
                            }
                        }
                        Some(Inbound::Identify { app, payload }) => {
                            match self.pending_identify.get(&app) {
                                Some(sender) => {
                                    let _ = sender.send(payload);
                                }
                                None => {
                                    tracing::debug!(%app, "Ignoring identify with no reload in flight");
                                }
                            }
                        }
                        Some(Inbound::Disconnected { connection }) => {
                            self.handle_disconnected(connection);
                        }
                        None => break,
                    }
                }
                Some(command) = self.commands.recv() => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some(expired) = self.heartbeats.next(), if !self.heartbeats.is_empty() => {
                    self.handle_heartbeat_timeout(expired.into_inner());
                }
                Some((unique_id, app, snapshot)) = self.inflight_reloads.next(), if !self.inflight_reloads.is_empty() => {
                    self.finish_reload(unique_id, app, snapshot).await;
                }
            }
        }

        tracing::info!("Bridge event loop stopped");
    }

    /// Turns any handler error into a structured reply. The second element
    /// asks the caller to start a reload once the reply is on its way.
    async fn handle_request(
        &mut self,
        connection: ConnectionId,
        body: &str,
    ) -> (Reply, Option<String>) {
        match self.process_request(connection, body).await {
            Ok(outcome) => outcome,
            Err((id, error)) => {
                tracing::debug!(%connection, code = %error.code(), "Rejecting request: {}", error);
                (Reply::error(id, error.code(), error.to_string()), None)
            }
        }
    }

    async fn process_request(
        &mut self,
        connection: ConnectionId,
        body: &str,
    ) -> Result<(Reply, Option<String>), (u64, BridgeError)> {
        let header: Header = serde_json::from_str(body).map_err(|error| {
            let id = serde_json::from_str::<IdOnly>(body)
                .map(|header| header.id)
                .unwrap_or(0);
            (id, BridgeError::InvalidMessageFormat(error.to_string()))
        })?;
        let id = header.id;

        let cap = header.kind.size_cap().unwrap_or(MAX_MESSAGE_SIZE);
        if body.len() > cap {
            let error = match header.kind {
                CommandClass::UpdateConfiguration => BridgeError::ConfigurationTooLarge {
                    got: body.len(),
                    cap,
                },
                _ => BridgeError::MessageTooLarge {
                    got: body.len(),
                    cap,
                },
            };
            return Err((id, error));
        }

        if let Some(limit) = header.kind.rate_limit() {
            self.rate_limiter
                .check((connection, header.kind), limit)
                .map_err(|error| (id, BridgeError::from(error)))?;
        }

        let command: InboundCommand = serde_json::from_str(body)
            .map_err(|error| (id, BridgeError::InvalidMessageFormat(error.to_string())))?;

        let outcome = match command {
            InboundCommand::Register {
                unique_id,
                app_metadata,
            } => self
                .handle_register(id, connection, unique_id, app_metadata)
                .await
                .map(|reply| (reply, None)),
            InboundCommand::Heartbeat { hash } => self.handle_heartbeat(id, connection, hash),
            InboundCommand::UpdateEntity { unique_id, changes } => self
                .handle_update_entity(id, connection, unique_id, changes)
                .await
                .map(|reply| (reply, None)),
            InboundCommand::UpdateConfiguration { configuration } => self
                .handle_update_configuration(id, connection, configuration)
                .await
                .map(|reply| (reply, None)),
            InboundCommand::GoingOffline { unique_id } => self
                .handle_going_offline(id, unique_id)
                .map(|reply| (reply, None)),
            InboundCommand::GetHealth { unique_id } => self
                .handle_get_health(id, unique_id)
                .map(|reply| (reply, None)),
        };

        outcome.map_err(|error| (id, error))
    }

    async fn handle_register(
        &mut self,
        id: u64,
        connection: ConnectionId,
        unique_id: String,
        snapshot: ConfigurationSnapshot,
    ) -> Result<Reply, BridgeError> {
        if !self.registry.contains(&unique_id) {
            return Err(BridgeError::BridgeNotFound);
        }
        self.registry.bind(connection, &unique_id);

        let timeout = self.env_config.heartbeat_timeout;
        let session = self
            .registry
            .get_mut(&unique_id)
            .ok_or(BridgeError::BridgeNotFound)?;

        Self::apply_snapshot(
            session,
            snapshot,
            self.device_registry.as_ref(),
            self.entity_registry.as_ref(),
            &mut self.events,
        )
        .await
        .map_err(BridgeError::RegistrationFailed)?;

        session.record_heartbeat(Instant::now());
        match session.heartbeat_timer {
            Some(key) => self.heartbeats.reset(&key, timeout),
            None => {
                session.heartbeat_timer = Some(self.heartbeats.insert(unique_id.clone(), timeout));
            }
        }

        // The reply reports the handshake state; the session goes online the
        // moment the handshake is complete.
        session.status = SessionStatus::Registered;
        let info = session.info();
        let app = session.app_name.clone();
        let entities = session.entities.len();
        let went_online = session.mark_online();
        if went_online {
            self.events.publish(
                &app,
                BridgeEvent::HealthChanged {
                    unique_id: unique_id.clone(),
                    status: SessionStatus::Online,
                },
            );
        }

        tracing::info!(%unique_id, %app, entities, "App registered");

        Ok(Reply::success(id).with_session(info))
    }

    /// A heartbeat refreshes the deadline and always reports drift. A
    /// heartbeat from an offline session brings it back online and kicks off
    /// a reload, because updates sent while offline were lost.
    fn handle_heartbeat(
        &mut self,
        id: u64,
        connection: ConnectionId,
        hash: String,
    ) -> Result<(Reply, Option<String>), BridgeError> {
        let timeout = self.env_config.heartbeat_timeout;
        let session = self
            .registry
            .by_connection_mut(connection)
            .ok_or(BridgeError::BridgeNotFound)?;
        if session.configuration.is_none() {
            return Err(BridgeError::HeartbeatFailed(anyhow!(
                "session has never registered a configuration"
            )));
        }

        session.record_heartbeat(Instant::now());
        match session.heartbeat_timer {
            Some(key) => self.heartbeats.reset(&key, timeout),
            None => {
                session.heartbeat_timer =
                    Some(self.heartbeats.insert(session.unique_id.clone(), timeout));
            }
        }

        let drift = session.hash_drift(&hash);
        if drift {
            tracing::warn!(
                unique_id = %session.unique_id,
                ours = %session.config_hash,
                theirs = %hash,
                "Configuration hash drifted"
            );
        }

        let unique_id = session.unique_id.clone();
        let app = session.app_name.clone();
        let was_offline = session.status == SessionStatus::Offline;
        let reload = was_offline.then(|| unique_id.clone());
        if was_offline {
            session.mark_online();
            tracing::info!(%unique_id, %app, "Session is back online");
            self.events.publish(
                &app,
                BridgeEvent::HealthChanged {
                    unique_id: unique_id.clone(),
                    status: SessionStatus::Online,
                },
            );
        }
        self.events.heartbeat(&app, &unique_id);

        Ok((Reply::success(id).with_drift(drift), reload))
    }

    fn handle_heartbeat_timeout(&mut self, unique_id: String) {
        let Some(session) = self.registry.get_mut(&unique_id) else {
            return;
        };
        session.heartbeat_timer = None;

        if session.mark_offline() {
            let app = session.app_name.clone();
            tracing::warn!(%unique_id, %app, "Missed heartbeat deadline, session is offline");
            self.events.publish(
                &app,
                BridgeEvent::HealthChanged {
                    unique_id,
                    status: SessionStatus::Offline,
                },
            );
        }
    }

    async fn handle_update_entity(
        &mut self,
        id: u64,
        connection: ConnectionId,
        unique_id: String,
        changes: AttrMap,
    ) -> Result<Reply, BridgeError> {
        let session = self
            .registry
            .by_connection_mut(connection)
            .ok_or(BridgeError::BridgeNotFound)?;
        let app = session.app_name.clone();

        let record = session
            .entities
            .merge_changes(&unique_id, &changes)
            .map_err(|error| BridgeError::UpdateFailed(error.into()))?
            .clone();

        self.entity_registry
            .upsert(&app, &record)
            .await
            .map_err(BridgeError::UpdateFailed)?;

        self.events.publish(
            &app,
            BridgeEvent::EntityUpdated {
                unique_id,
                data: record.merged_data(),
            },
        );

        Ok(Reply::success(id))
    }

    async fn handle_update_configuration(
        &mut self,
        id: u64,
        connection: ConnectionId,
        snapshot: ConfigurationSnapshot,
    ) -> Result<Reply, BridgeError> {
        let session = self
            .registry
            .by_connection_mut(connection)
            .ok_or(BridgeError::BridgeNotFound)?;

        Self::apply_snapshot(
            session,
            snapshot,
            self.device_registry.as_ref(),
            self.entity_registry.as_ref(),
            &mut self.events,
        )
        .await
        .map_err(BridgeError::ConfigurationUpdateFailed)?;

        Ok(Reply::success(id))
    }

    fn handle_going_offline(&mut self, id: u64, unique_id: String) -> Result<Reply, BridgeError> {
        let session = self
            .registry
            .get_mut(&unique_id)
            .ok_or(BridgeError::BridgeNotFound)?;
        if session.status == SessionStatus::Unregistered {
            return Err(BridgeError::GoingOfflineFailed(anyhow!(
                "session has never registered"
            )));
        }

        let key = session.heartbeat_timer.take();
        let app = session.app_name.clone();
        let changed = session.mark_offline();

        if let Some(key) = key {
            self.heartbeats.try_remove(&key);
        }
        if self.pending_identify.remove(&app).is_some() {
            tracing::debug!(%app, "Canceled in-flight reload");
        }
        if changed {
            tracing::info!(%unique_id, %app, "App announced it is going offline");
            self.events.publish(
                &app,
                BridgeEvent::HealthChanged {
                    unique_id,
                    status: SessionStatus::Offline,
                },
            );
        }

        Ok(Reply::success(id))
    }

    fn handle_get_health(
        &mut self,
        id: u64,
        unique_id: Option<String>,
    ) -> Result<Reply, BridgeError> {
        if let Some(unique_id) = &unique_id {
            if !self.registry.contains(unique_id) {
                return Err(BridgeError::BridgeNotFound);
            }
        }

        Ok(Reply::success(id).with_health(self.collect_health(unique_id.as_deref())))
    }

    fn collect_health(&self, unique_id: Option<&str>) -> Vec<SessionHealth> {
        let now = Instant::now();
        match unique_id {
            Some(unique_id) => self
                .registry
                .get(unique_id)
                .map(|session| vec![session.health(now)])
                .unwrap_or_default(),
            None => self.registry.iter().map(|session| session.health(now)).collect(),
        }
    }

    /// Replaces the session's configuration as a whole and mirrors the
    /// resulting device and entity diffs into the host registries.
    async fn apply_snapshot(
        session: &mut AppSession,
        snapshot: ConfigurationSnapshot,
        device_registry: &dyn DeviceRegistry,
        entity_registry: &dyn EntityRegistry,
        events: &mut EventPublisher,
    ) -> Result<()> {
        let app = session.app_name.clone();

        session.config_hash = snapshot.hash.clone();
        let device_diff = session
            .devices
            .reconcile(&snapshot.device, &snapshot.secondary_devices);
        let entity_diff = session
            .entities
            .reconcile(&snapshot.entities, &snapshot.device.unique_id);
        session.configuration = Some(snapshot);

        tracing::debug!(
            unique_id = %session.unique_id,
            devices_created = device_diff.created.len(),
            devices_removed = device_diff.removed.len(),
            entities_created = entity_diff.created.len(),
            entities_updated = entity_diff.updated.len(),
            entities_removed = entity_diff.removed.len(),
            "Applied configuration snapshot"
        );

        for unique_id in device_diff.created.iter().chain(&device_diff.updated) {
            if let Some(record) = session.devices.get(unique_id) {
                device_registry
                    .upsert(&app, record)
                    .await
                    .with_context(|| format!("Failed to mirror device {unique_id}"))?;
            }
        }
        for unique_id in &device_diff.removed {
            device_registry
                .remove(&app, unique_id)
                .await
                .with_context(|| format!("Failed to drop device {unique_id}"))?;
        }

        for unique_id in entity_diff.created.iter().chain(&entity_diff.updated) {
            if let Some(record) = session.entities.get(unique_id) {
                entity_registry
                    .upsert(&app, record)
                    .await
                    .with_context(|| format!("Failed to mirror entity {unique_id}"))?;
            }
        }
        for unique_id in &entity_diff.removed {
            if session.entities.contains(unique_id) {
                // Removed and re-created in the same pass, the upsert above
                // already wrote the fresh record.
                continue;
            }
            entity_registry
                .remove(&app, unique_id)
                .await
                .with_context(|| format!("Failed to drop entity {unique_id}"))?;
        }

        for unique_id in entity_diff.created {
            if let Some(record) = session.entities.get(&unique_id) {
                events.publish(
                    &app,
                    BridgeEvent::EntityRegistered {
                        unique_id,
                        domain: record.domain,
                    },
                );
            }
        }
        for unique_id in entity_diff.updated {
            if let Some(record) = session.entities.get(&unique_id) {
                events.publish(
                    &app,
                    BridgeEvent::EntityUpdated {
                        unique_id,
                        data: record.merged_data(),
                    },
                );
            }
        }

        Ok(())
    }

    /// Starts a discovery round for the app owning `unique_id`, unless one is
    /// already in flight. Attempts are bounded and evenly spaced; each sends
    /// a discovery broadcast and waits briefly for an identify payload.
    fn begin_reload(&mut self, unique_id: &str) {
        let Some(session) = self.registry.get(unique_id) else {
            return;
        };
        let app = session.app_name.clone();
        if self.pending_identify.contains_key(&app) {
            tracing::debug!(%app, "Reload already in flight");
            return;
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.pending_identify.insert(app.clone(), sender);

        let outbound = self.outbound.clone();
        let attempts = self.env_config.reload_attempts;
        let delay = self.env_config.reload_delay;
        let timeout = self.env_config.discovery_timeout;
        let unique_id = unique_id.to_owned();

        tracing::info!(%unique_id, %app, "Reloading configuration via discovery");

        self.inflight_reloads.push(
            async move {
                for attempt in 1..=attempts {
                    if attempt > 1 {
                        tokio::time::sleep(delay).await;
                    }
                    if outbound.send(OutboundMessage::discovery(&app)).is_err() {
                        break;
                    }
                    match tokio::time::timeout(timeout, receiver.recv()).await {
                        Ok(Some(payload)) => match codec::decode(&payload) {
                            Ok(snapshot) => return (unique_id, app, Some(snapshot)),
                            Err(error) => {
                                tracing::warn!(
                                    %app,
                                    attempt,
                                    "Discarding malformed identify payload: {}",
                                    error
                                );
                            }
                        },
                        Ok(None) => break,
                        Err(_) => {
                            tracing::debug!(%app, attempt, "Identify attempt timed out");
                        }
                    }
                }
                (unique_id, app, None)
            }
            .boxed(),
        );
    }

    async fn finish_reload(
        &mut self,
        unique_id: String,
        app: String,
        snapshot: Option<ConfigurationSnapshot>,
    ) {
        self.pending_identify.remove(&app);

        let Some(snapshot) = snapshot else {
            tracing::warn!(%unique_id, %app, "Reload got no identify reply, keeping last-known state");
            return;
        };
        let Some(session) = self.registry.get_mut(&unique_id) else {
            return;
        };
        if session.status != SessionStatus::Online {
            // The session was taken offline or torn down while the round ran;
            // its snapshot no longer speaks for the app.
            tracing::debug!(%unique_id, %app, status = %session.status, "Discarding reload result");
            return;
        }

        if let Err(error) = Self::apply_snapshot(
            session,
            snapshot,
            self.device_registry.as_ref(),
            self.entity_registry.as_ref(),
            &mut self.events,
        )
        .await
        {
            tracing::warn!(%unique_id, "Failed to apply reloaded configuration: {:#}", error);
            return;
        }

        tracing::info!(%unique_id, %app, "Reloaded configuration applied");
    }

    /// An abrupt disconnect only unbinds the connection; the session stays
    /// as-is until the heartbeat deadline decides it is offline.
    fn handle_disconnected(&mut self, connection: ConnectionId) {
        tracing::debug!(%connection, "Transport connection lost");
        self.registry.unbind_connection(connection);
        self.rate_limiter.forget(|(conn, _)| *conn == connection);
    }

    async fn handle_command(&mut self, command: HandleCommand) -> ControlFlow<()> {
        match command {
            HandleCommand::AddApp {
                unique_id,
                app_name,
                done,
            } => {
                if !self.registry.contains(&unique_id) {
                    tracing::info!(%unique_id, app = %app_name, "Tracking new app");
                    self.registry.insert(AppSession::new(unique_id, app_name));
                }
                let _ = done.send(());
            }
            HandleCommand::RemoveApp { unique_id, done } => {
                let _ = done.send(self.remove_app(&unique_id).await);
            }
            HandleCommand::SendCommand {
                app,
                command,
                unique_id,
                args,
            } => {
                let message = dispatch::command(&self.namespace, &app, &command, &unique_id, &args);
                tracing::debug!(%app, %command, %unique_id, "Sending command");
                let _ = self.outbound.send(message);
            }
            HandleCommand::GetHealth { unique_id, reply } => {
                let _ = reply.send(self.collect_health(unique_id.as_deref()));
            }
            HandleCommand::Entity { unique_id, reply } => {
                let found = self.registry.iter().find_map(|session| {
                    session
                        .entities
                        .get(&unique_id)
                        .map(|record| (record.clone(), session.status))
                });
                let _ = reply.send(found);
            }
            HandleCommand::Subscribe { app, reply } => {
                let _ = reply.send(self.events.subscribe(&app));
            }
            HandleCommand::Shutdown { done } => {
                let apps: Vec<(String, String)> = self
                    .registry
                    .iter()
                    .map(|session| (session.unique_id.clone(), session.app_name.clone()))
                    .collect();
                for (unique_id, app) in apps {
                    self.events.publish(&app, BridgeEvent::Shutdown);
                    tracing::debug!(%unique_id, %app, "Notified app of shutdown");
                }
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    /// Tears a session down completely: timer, mirrored records, event
    /// subscribers and finally the session itself.
    async fn remove_app(&mut self, unique_id: &str) -> bool {
        let Some(session) = self.registry.get_mut(unique_id) else {
            return false;
        };
        session.begin_shutdown();
        let key = session.heartbeat_timer.take();
        let app = session.app_name.clone();
        let entity_ids: Vec<String> = session
            .entities
            .iter()
            .map(|record| record.unique_id.clone())
            .collect();
        let device_ids: Vec<String> = session
            .devices
            .iter()
            .map(|record| record.info.unique_id.clone())
            .collect();

        if let Some(key) = key {
            self.heartbeats.try_remove(&key);
        }
        for id in entity_ids {
            if let Err(error) = self.entity_registry.remove(&app, &id).await {
                tracing::warn!(%id, "Failed to drop mirrored entity: {:#}", error);
            }
        }
        for id in device_ids {
            if let Err(error) = self.device_registry.remove(&app, &id).await {
                tracing::warn!(%id, "Failed to drop mirrored device: {:#}", error);
            }
        }

        self.pending_identify.remove(&app);
        self.events.publish(&app, BridgeEvent::Shutdown);
        self.registry.remove(unique_id);

        tracing::info!(%unique_id, %app, "App removed");
        true
    }
}

/// Cheap clone-able handle used by the host to drive the loop.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<HandleCommand>,
}

impl BridgeHandle {
    /// Starts tracking an app. Registrations for unknown unique ids are
    /// rejected, so this must happen before the app registers.
    pub async fn add_app(&self, unique_id: String, app_name: String) -> Result<()> {
        let (done, confirmation) = oneshot::channel();
        self.send(HandleCommand::AddApp {
            unique_id,
            app_name,
            done,
        })
        .await?;
        confirmation.await.context("Bridge event loop is gone")
    }

    /// Removes an app and everything it registered. Returns false if the
    /// unique id was not tracked.
    pub async fn remove_app(&self, unique_id: String) -> Result<bool> {
        let (done, confirmation) = oneshot::channel();
        self.send(HandleCommand::RemoveApp { unique_id, done })
            .await?;
        confirmation.await.context("Bridge event loop is gone")
    }

    /// Fire-and-forget command to an entity on the remote app.
    pub async fn send_command(
        &self,
        app: String,
        command: String,
        unique_id: String,
        args: AttrMap,
    ) -> Result<()> {
        self.send(HandleCommand::SendCommand {
            app,
            command,
            unique_id,
            args,
        })
        .await
    }

    pub async fn health(&self, unique_id: Option<String>) -> Result<Vec<SessionHealth>> {
        let (reply, response) = oneshot::channel();
        self.send(HandleCommand::GetHealth { unique_id, reply })
            .await?;
        response.await.context("Bridge event loop is gone")
    }

    /// Looks up a tracked entity and the status of its owning session.
    pub async fn entity(&self, unique_id: String) -> Result<Option<(EntityRecord, SessionStatus)>> {
        let (reply, response) = oneshot::channel();
        self.send(HandleCommand::Entity { unique_id, reply })
            .await?;
        response.await.context("Bridge event loop is gone")
    }

    pub async fn subscribe(&self, app: String) -> Result<mpsc::UnboundedReceiver<BridgeEvent>> {
        let (reply, response) = oneshot::channel();
        self.send(HandleCommand::Subscribe { app, reply }).await?;
        response.await.context("Bridge event loop is gone")
    }

    /// Broadcasts shutdown to every app and stops the loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, confirmation) = oneshot::channel();
        self.send(HandleCommand::Shutdown { done }).await?;
        confirmation.await.context("Bridge event loop is gone")
    }

    async fn send(&self, command: HandleCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("Bridge event loop is gone"))
    }
}
