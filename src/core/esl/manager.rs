//! Connection manager: one supervised event-socket connection per switch
//! instance, with reconnect, heartbeat and event routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, SwitchEndpoint};
use crate::core::backoff::BackoffPolicy;
use crate::core::session::registry::SessionRegistry;
use crate::core::session::session_event::SessionEvent;

use super::connection::EslConnection;
use super::error::{EslError, EslResult};
use super::event::{CommandReply, EslCommand, EslEvent};

/// Decides what to do with a call-creation event for a leg the registry
/// does not know. Implemented by the session launcher.
#[async_trait]
pub trait IncomingCallHandler: Send + Sync {
    async fn on_call_created(&self, instance_id: &str, event: &EslEvent);
}

struct InstanceHandle {
    endpoint: SwitchEndpoint,
    connection: tokio::sync::RwLock<Option<Arc<EslConnection>>>,
    link_up: AtomicBool,
}

/// Owns every switch connection. Sessions and the outbound scheduler go
/// through this for all switch commands; inbound events are routed to
/// sessions via the registry.
pub struct EslManager {
    config: ServerConfig,
    instances: parking_lot::RwLock<HashMap<String, Arc<InstanceHandle>>>,
    registry: Arc<SessionRegistry>,
    dispatcher: parking_lot::RwLock<Option<Arc<dyn IncomingCallHandler>>>,
    shutdown: AtomicBool,
}

impl EslManager {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            instances: parking_lot::RwLock::new(HashMap::new()),
            registry,
            dispatcher: parking_lot::RwLock::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Wire the incoming-call handler. Must happen before `connect` so
    /// call-creation events are not dropped on the floor.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn IncomingCallHandler>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    /// Register a switch instance and start its supervisor task. The task
    /// keeps the connection alive until `shutdown` is called: reconnects
    /// use the shared backoff policy with no attempt bound, and sessions
    /// on the instance are marked degraded (never destroyed) while the
    /// link is down.
    pub fn connect(self: &Arc<Self>, endpoint: SwitchEndpoint) {
        let handle = Arc::new(InstanceHandle {
            endpoint: endpoint.clone(),
            connection: tokio::sync::RwLock::new(None),
            link_up: AtomicBool::new(false),
        });
        self.instances
            .write()
            .insert(endpoint.instance_id.clone(), handle.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(handle).await;
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let instances = self.instances.read();
        for handle in instances.values() {
            if let Some(conn) = handle.connection.try_read().ok().and_then(|g| g.clone()) {
                conn.shutdown();
            }
        }
    }

    pub fn is_connected(&self, instance_id: &str) -> bool {
        self.instances
            .read()
            .get(instance_id)
            .map(|h| h.link_up.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn originate_timeout(&self) -> std::time::Duration {
        self.config.originate_timeout
    }

    /// Link state per instance, for the health surface.
    pub fn link_states(&self) -> Vec<(String, bool)> {
        self.instances
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), h.link_up.load(Ordering::Acquire)))
            .collect()
    }

    async fn supervise(self: Arc<Self>, handle: Arc<InstanceHandle>) {
        let policy = BackoffPolicy::reconnect();
        let mut attempt: u32 = 0;
        let instance_id = handle.endpoint.instance_id.clone();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let (event_tx, event_rx) = mpsc::channel::<EslEvent>(256);
            match EslConnection::open(&handle.endpoint, event_tx, self.config.connect_timeout)
                .await
            {
                Ok(conn) => {
                    attempt = 0;
                    let conn = Arc::new(conn);
                    *handle.connection.write().await = Some(conn.clone());
                    handle.link_up.store(true, Ordering::Release);
                    self.registry.set_instance_degraded(&instance_id, false);

                    let router = {
                        let manager = self.clone();
                        let instance_id = instance_id.clone();
                        tokio::spawn(async move {
                            manager.route_events(instance_id, event_rx).await;
                        })
                    };

                    self.keep_alive(&instance_id, &conn).await;

                    // Outage: degrade but keep every session, per the
                    // reconnect contract.
                    handle.link_up.store(false, Ordering::Release);
                    *handle.connection.write().await = None;
                    self.registry.set_instance_degraded(&instance_id, true);
                    router.abort();

                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(instance = %instance_id, "event socket lost, scheduling reconnect");
                }
                Err(e) => {
                    warn!(instance = %instance_id, error = %e, "event socket connect failed");
                }
            }

            attempt += 1;
            // reconnect() has no attempt bound, so delay is always Some
            let delay = policy.delay(attempt).unwrap_or(policy.cap);
            debug!(instance = %instance_id, attempt, ?delay, "reconnect backoff");
            tokio::time::sleep(delay).await;
        }
        info!(instance = %instance_id, "supervisor stopped");
    }

    /// Heartbeat until the connection dies. A missed heartbeat reply is a
    /// silent failure: drop the connection and let the supervisor recycle.
    async fn keep_alive(&self, instance_id: &str, conn: &Arc<EslConnection>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = conn.wait_closed() => return,
                _ = ticker.tick() => {
                    match self.submit_on(conn, EslCommand::heartbeat()).await {
                        Ok(reply) if reply.ok => {}
                        Ok(reply) => {
                            warn!(instance = %instance_id, "heartbeat rejected: {}", reply.text);
                        }
                        Err(e) => {
                            warn!(instance = %instance_id, error = %e, "heartbeat failed, dropping connection");
                            conn.shutdown();
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn submit_on(
        &self,
        conn: &Arc<EslConnection>,
        command: EslCommand,
    ) -> EslResult<CommandReply> {
        self.submit_on_bounded(conn, command, self.config.command_timeout)
            .await
    }

    async fn submit_on_bounded(
        &self,
        conn: &Arc<EslConnection>,
        command: EslCommand,
        reply_timeout: std::time::Duration,
    ) -> EslResult<CommandReply> {
        let reply_rx = conn.submit(command).await?;
        match tokio::time::timeout(reply_timeout, reply_rx).await {
            Err(_) => Err(EslError::CommandTimeout(reply_timeout)),
            Ok(Err(_)) => Err(EslError::ConnectionLost),
            Ok(Ok(result)) => result,
        }
    }

    /// Issue a command on an instance and wait for the switch's reply,
    /// bounded by the command timeout. A timed-out command is retried
    /// once before the error is surfaced.
    pub async fn send_command(
        &self,
        instance_id: &str,
        command: EslCommand,
    ) -> EslResult<CommandReply> {
        self.send_command_bounded(instance_id, command, self.config.command_timeout)
            .await
    }

    /// Slow-path commands (originate rides out the full ring time) pass
    /// their own reply bound.
    pub async fn send_command_bounded(
        &self,
        instance_id: &str,
        command: EslCommand,
        reply_timeout: std::time::Duration,
    ) -> EslResult<CommandReply> {
        let handle = {
            let instances = self.instances.read();
            instances
                .get(instance_id)
                .ok_or_else(|| EslError::UnknownInstance(instance_id.to_string()))?
                .clone()
        };
        let conn = handle
            .connection
            .read()
            .await
            .clone()
            .ok_or(EslError::ConnectionLost)?;

        match self.submit_on_bounded(&conn, command.clone(), reply_timeout).await {
            Err(EslError::CommandTimeout(_)) => {
                debug!(instance = %instance_id, %command, "command timed out, retrying once");
                self.submit_on_bounded(&conn, command, reply_timeout).await
            }
            other => other,
        }
    }

    async fn route_events(self: Arc<Self>, instance_id: String, mut rx: mpsc::Receiver<EslEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(leg_id) = event.leg_id().map(str::to_string) else {
                debug!(instance = %instance_id, event = %event.name, "event without leg id dropped");
                continue;
            };

            let known = self.registry.contains(&leg_id);
            match event.name.as_str() {
                "CHANNEL_CREATE" if !known => {
                    let dispatcher = self.dispatcher.read().clone();
                    match dispatcher {
                        Some(dispatcher) => dispatcher.on_call_created(&instance_id, &event).await,
                        None => warn!(leg = %leg_id, "call created before dispatcher wired, dropped"),
                    }
                }
                "CHANNEL_CREATE" => {} // replayed create for a leg we already track
                "CHANNEL_ANSWER" => {
                    self.registry.dispatch(&leg_id, SessionEvent::Answered).await;
                }
                "CHANNEL_EXECUTE_COMPLETE" => {
                    if event.header("Application") == Some("playback") {
                        let audio_ref = event
                            .header("Application-Data")
                            .unwrap_or_default()
                            .to_string();
                        self.registry
                            .dispatch(&leg_id, SessionEvent::PlaybackFinished { audio_ref })
                            .await;
                    }
                }
                "CHANNEL_HANGUP" => {
                    let cause = event.hangup_cause().map(str::to_string);
                    self.registry
                        .dispatch(&leg_id, SessionEvent::Hangup { cause })
                        .await;
                }
                other => {
                    debug!(instance = %instance_id, leg = %leg_id, event = %other, "unhandled event dropped");
                }
            }
        }
    }
}
