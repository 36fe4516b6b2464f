// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The dispatcher task.
//!
//! Owns the [`Database`] and the table of live sessions. Every connect,
//! packet and disconnect arrives on one channel, so all store mutation is
//! serialized here. The dispatcher never awaits a session: replies and
//! pushes go out with `try_send` over bounded per-session channels. While an
//! asynchronous session still has a packet queued, its held mail stays in the
//! store's outbox, where the `max_held_mail` cap applies.

use super::protocol::SessionMode;
use crate::config::BrokerConfig;
use crate::db::{ApplyError, Database};
use crate::message::Message;
use crate::time::Clock;
use crate::variable::{RateEstimator, Variable};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Packets that may wait in one session's outbound queue.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Outbound queue of one session. Each item is one packet.
pub type Outbound = mpsc::Sender<Vec<Message>>;

/// Commands accepted by the dispatcher.
#[derive(Debug)]
pub enum DispatchCommand {
    /// A session became active.
    Connect {
        client: String,
        session_id: u64,
        mode: SessionMode,
        consolidation_period: f64,
        outbound: Outbound,
    },
    /// Inbound batch from a session.
    Packet {
        client: String,
        session_id: u64,
        messages: Vec<Message>,
    },
    /// A session ended; purge the client.
    Disconnect { client: String, session_id: u64 },
    /// List connected clients.
    ClientNames { reply: oneshot::Sender<Vec<String>> },
    /// Copy one variable.
    Snapshot {
        key: String,
        reply: oneshot::Sender<Option<Variable>>,
    },
    /// Stop the dispatcher.
    Shutdown { done: oneshot::Sender<()> },
}

/// The dispatcher task is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispatcher is not running")]
pub struct DispatcherClosed;

/// Cloneable handle to the dispatcher task.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchCommand>,
}

impl DispatcherHandle {
    /// Register a live session.
    pub fn connect(
        &self,
        client: &str,
        session_id: u64,
        mode: SessionMode,
        consolidation_period: f64,
        outbound: Outbound,
    ) -> Result<(), DispatcherClosed> {
        self.send(DispatchCommand::Connect {
            client: client.to_string(),
            session_id,
            mode,
            consolidation_period,
            outbound,
        })
    }

    /// Forward an inbound packet.
    pub fn packet(
        &self,
        client: &str,
        session_id: u64,
        messages: Vec<Message>,
    ) -> Result<(), DispatcherClosed> {
        self.send(DispatchCommand::Packet {
            client: client.to_string(),
            session_id,
            messages,
        })
    }

    /// Report a session end.
    pub fn disconnect(&self, client: &str, session_id: u64) -> Result<(), DispatcherClosed> {
        self.send(DispatchCommand::Disconnect {
            client: client.to_string(),
            session_id,
        })
    }

    /// Connected client names, sorted.
    pub async fn client_names(&self) -> Result<Vec<String>, DispatcherClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(DispatchCommand::ClientNames { reply })?;
        rx.await.map_err(|_| DispatcherClosed)
    }

    /// Copy of a variable, if it exists.
    pub async fn snapshot(&self, key: &str) -> Result<Option<Variable>, DispatcherClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(DispatchCommand::Snapshot {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| DispatcherClosed)
    }

    /// Stop the dispatcher after the commands already queued.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(DispatchCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, cmd: DispatchCommand) -> Result<(), DispatcherClosed> {
        self.tx.send(cmd).map_err(|_| DispatcherClosed)
    }
}

/// Dispatcher-side view of one session.
#[derive(Debug)]
struct SessionLink {
    id: u64,
    mode: SessionMode,
    requested_consolidation: f64,
    packet_rate: RateEstimator,
    outbound: Outbound,
}

impl SessionLink {
    /// A packet sent earlier has not been picked up by the session yet.
    fn backlogged(&self) -> bool {
        self.outbound.capacity() < self.outbound.max_capacity()
    }

    /// Queue a packet without waiting.
    fn deliver(&self, client: &str, packet: Vec<Message>) {
        match self.outbound.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                "Outbound queue of '{}' (session {}) full, packet dropped",
                client, self.id
            ),
            Err(TrySendError::Closed(_)) => {
                debug!("Session {} of '{}' no longer reading", self.id, client)
            }
        }
    }
}

/// Single owner of the variable store.
pub struct Dispatcher {
    db: Database,
    sessions: BTreeMap<String, SessionLink>,
    clock: Clock,
    heartbeat: Duration,
    max_packet_rate_hz: f64,
    throttled_period: f64,
    rx: mpsc::UnboundedReceiver<DispatchCommand>,
}

impl Dispatcher {
    /// Build a dispatcher and the handle that feeds it.
    pub fn new(config: &BrokerConfig, clock: Clock) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = Database::new(
            config.community.clone(),
            config.db_name(),
            config.max_held_mail,
            clock.now(),
        );
        let dispatcher = Self {
            db,
            sessions: BTreeMap::new(),
            clock,
            heartbeat: config.heartbeat_interval(),
            max_packet_rate_hz: config.max_client_packet_rate_hz,
            throttled_period: config.throttled_consolidation_period(),
            rx,
        };
        (dispatcher, DispatcherHandle { tx })
    }

    /// Spawn the dispatcher on the current runtime.
    pub fn spawn(config: &BrokerConfig, clock: Clock) -> (DispatcherHandle, JoinHandle<()>) {
        let (dispatcher, handle) = Self::new(config, clock);
        let task = tokio::spawn(dispatcher.run());
        (handle, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Dispatcher started");
        loop {
            match tokio::time::timeout(self.heartbeat, self.rx.recv()).await {
                Ok(Some(DispatchCommand::Shutdown { done })) => {
                    let _ = done.send(());
                    break;
                }
                Ok(Some(cmd)) => self.handle(cmd),
                Ok(None) => break,
                Err(_) => {} // heartbeat
            }
            self.tick();
        }

        let stats = self.db.stats();
        info!(
            "Dispatcher stopped: {} writes, {} rejected, {} deliveries",
            stats.writes, stats.rejected, stats.deliveries
        );
    }

    fn handle(&mut self, cmd: DispatchCommand) {
        match cmd {
            DispatchCommand::Connect {
                client,
                session_id,
                mode,
                consolidation_period,
                outbound,
            } => self.on_connect(client, session_id, mode, consolidation_period, outbound),
            DispatchCommand::Packet {
                client,
                session_id,
                messages,
            } => self.on_packet(&client, session_id, messages),
            DispatchCommand::Disconnect { client, session_id } => {
                self.on_disconnect(&client, session_id)
            }
            DispatchCommand::ClientNames { reply } => {
                let _ = reply.send(self.client_names());
            }
            DispatchCommand::Snapshot { key, reply } => {
                let _ = reply.send(self.db.get(&key).cloned());
            }
            DispatchCommand::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn on_connect(
        &mut self,
        client: String,
        session_id: u64,
        mode: SessionMode,
        consolidation_period: f64,
        outbound: Outbound,
    ) {
        let now = self.clock.now();
        if let Some(old) = self.sessions.get(&client) {
            warn!(
                "Session {} for '{}' replaced by session {} without disconnect",
                old.id, client, session_id
            );
            self.db.disconnect(&client, now);
        }

        self.sessions.insert(
            client.clone(),
            SessionLink {
                id: session_id,
                mode,
                requested_consolidation: consolidation_period.max(0.0),
                packet_rate: RateEstimator::new(),
                outbound,
            },
        );
        self.db.connect(&client, now);
        debug!("Dispatcher linked '{}' (session {}, {})", client, session_id, mode);
    }

    fn on_packet(&mut self, client: &str, session_id: u64, messages: Vec<Message>) {
        let names = self.client_names();
        let now = self.clock.now();

        let link = match self.sessions.get_mut(client) {
            Some(link) if link.id == session_id => link,
            Some(link) => {
                debug!(
                    "Dropping packet from stale session {} of '{}' (current {})",
                    session_id, client, link.id
                );
                return;
            }
            None => {
                error!(
                    "Packet from '{}' (session {}) which has no dispatcher entry",
                    client, session_id
                );
                return;
            }
        };
        link.packet_rate.record(now);

        let mut results = Vec::new();
        for msg in messages {
            let kind = msg.kind();
            match self.db.apply(msg, client, &names, now, &mut results) {
                Ok(()) => {}
                Err(e @ ApplyError::TypeMismatch { .. }) => warn!("Rejected write: {}", e),
                Err(e) => warn!("Rejected {} from '{}': {}", kind, client, e),
            }
        }

        let mut reply = Vec::with_capacity(1 + results.len());
        reply.push(keepalive(
            link,
            now,
            self.max_packet_rate_hz,
            self.throttled_period,
        ));
        // A backlogged async session keeps its mail in the capped outbox
        if link.mode == SessionMode::Synchronous || !link.backlogged() {
            reply.extend(self.db.take_mail(client));
        }
        reply.extend(results);

        link.deliver(client, reply);
    }

    fn on_disconnect(&mut self, client: &str, session_id: u64) {
        match self.sessions.get(client) {
            Some(link) if link.id == session_id => {
                self.sessions.remove(client);
                let now = self.clock.now();
                self.db.disconnect(client, now);
                debug!("Dispatcher purged '{}' (session {})", client, session_id);
            }
            Some(link) => debug!(
                "Ignoring disconnect of stale session {} for '{}' (current {})",
                session_id, client, link.id
            ),
            None => debug!("Ignoring disconnect of unknown client '{}'", client),
        }
    }

    /// Periodic work: self-variables, then push held mail to async sessions.
    fn tick(&mut self) {
        let now = self.clock.now();
        let names = self.client_names();
        self.db.refresh_self_variables(now, &names);

        for (client, link) in &self.sessions {
            if link.mode != SessionMode::Asynchronous
                || link.backlogged()
                || !self.db.has_mail(client)
            {
                continue;
            }
            let mail = self.db.take_mail(client);
            let mut packet = Vec::with_capacity(1 + mail.len());
            packet.push(keepalive(
                link,
                now,
                self.max_packet_rate_hz,
                self.throttled_period,
            ));
            packet.extend(mail);
            link.deliver(client, packet);
        }
    }

    fn client_names(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }
}

/// Keepalive message heading every packet sent to a session.
fn keepalive(link: &SessionLink, now: f64, max_rate_hz: f64, throttled_period: f64) -> Message {
    match link.mode {
        SessionMode::Synchronous => Message::Null { time: now },
        SessionMode::Asynchronous => {
            let consolidation_period = if link.packet_rate.hz() >= max_rate_hz {
                throttled_period
            } else {
                link.requested_consolidation
            };
            Message::Timing {
                time: now,
                consolidation_period,
            }
        }
    }
}
