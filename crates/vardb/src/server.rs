// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker core: connection manager and public handle.
//!
//! The connection manager accepts sockets, runs each handshake in its own
//! task, admits named clients (replacing an existing session on a name
//! collision), and on every session end tells the dispatcher to purge the
//! client before handing the session to the reaper.

use crate::config::BrokerConfig;
use crate::time::Clock;
use crate::variable::Variable;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod reaper;
pub mod session;

pub use connection::{ClientConnection, ConnectionError};
pub use dispatcher::{DispatchCommand, Dispatcher, DispatcherClosed, DispatcherHandle};
pub use protocol::{Frame, ProtocolError, SessionMode};
pub use reaper::{Reaper, ReaperHandle, ReaperStats};
pub use session::{CloseReason, Hello, LiveSession, SessionEvent, SessionState};

/// Pause after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The variable broker.
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    clock: Clock,
    dispatcher: DispatcherHandle,
    shutdown: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
    /// Set once a run has ended; the dispatcher is gone for good.
    finished: Arc<AtomicBool>,
    client_count: Arc<AtomicUsize>,
}

impl Broker {
    /// Create a broker and start its dispatcher.
    pub async fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config
            .validate()
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        let clock = Clock::new(config.time_warp);
        let (dispatcher, _task) = Dispatcher::spawn(&config, clock.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            clock,
            dispatcher,
            shutdown: Arc::new(shutdown),
            running: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            client_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BrokerError::Bind(format!("{}: {}", addr, e)))?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    ///
    /// A broker serves once: after shutdown, build a new one.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BrokerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyRunning);
        }
        if self.finished.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            return Err(BrokerError::Stopped);
        }

        let local_addr = listener.local_addr()?;
        info!(
            "Broker '{}' listening on {}",
            self.config.community, local_addr
        );

        let (reaper, reaper_task) = Reaper::spawn(self.config.shutdown_grace());
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut manager = ConnectionManager {
            config: self.config.clone(),
            clock: self.clock.clone(),
            dispatcher: self.dispatcher.clone(),
            reaper: reaper.clone(),
            sessions: HashMap::new(),
            next_session_id: 1,
            client_count: self.client_count.clone(),
            ready_tx,
            events_tx,
        };
        manager
            .run(listener, ready_rx, events_rx, self.shutdown.subscribe())
            .await;

        let stats = reaper.shutdown().await;
        let _ = reaper_task.await;
        debug!(
            "Reaper drained: {} sessions, {} aborted tasks",
            stats.reaped, stats.aborted
        );
        self.dispatcher.shutdown().await;

        self.client_count.store(0, Ordering::SeqCst);
        self.finished.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        info!("Broker '{}' stopped", self.config.community);
        Ok(())
    }

    /// Signal the broker to shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Check if the broker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of active sessions.
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Names of connected clients as seen by the dispatcher.
    pub async fn client_names(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.dispatcher.client_names().await?)
    }

    /// Copy of a variable.
    pub async fn snapshot(&self, key: &str) -> Result<Option<Variable>, BrokerError> {
        Ok(self.dispatcher.snapshot(key).await?)
    }

    /// Current broker time.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

/// Named connection ready to become a session.
struct Ready {
    conn: ClientConnection,
    hello: Hello,
}

/// Accept loop state. Lives for one `run`.
struct ConnectionManager {
    config: Arc<BrokerConfig>,
    clock: Clock,
    dispatcher: DispatcherHandle,
    reaper: ReaperHandle,
    sessions: HashMap<String, LiveSession>,
    next_session_id: u64,
    client_count: Arc<AtomicUsize>,
    ready_tx: mpsc::UnboundedSender<Ready>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionManager {
    async fn run(
        &mut self,
        listener: TcpListener,
        mut ready_rx: mpsc::UnboundedReceiver<Ready>,
        mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = session::stopped(&mut shutdown) => {
                    info!("Shutdown signal received");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr),
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(ready) = ready_rx.recv() => self.on_ready(ready),
                Some(SessionEvent::Closed { client, session_id, reason }) = events_rx.recv() => {
                    self.on_closed(&client, session_id, reason)
                }
            }
        }

        info!("Retiring {} sessions", self.sessions.len());
        for (_, session) in self.sessions.drain() {
            let _ = self.dispatcher.disconnect(&session.client, session.id);
            self.reaper.retire(session);
        }
        self.client_count.store(0, Ordering::SeqCst);
    }

    /// Accepting: hand the socket to a handshake task.
    fn on_accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!("New connection from {}", peer_addr);

        let mut conn = ClientConnection::new(
            stream,
            peer_addr,
            self.config.max_message_size,
            self.config.tcp_nodelay,
        );
        let timeout = self.config.handshake_timeout();
        let ready_tx = self.ready_tx.clone();

        tokio::spawn(async move {
            match session::handshake(&mut conn, timeout).await {
                Ok(hello) => {
                    let _ = ready_tx.send(Ready { conn, hello });
                }
                Err(e) => warn!("Handshake with {} failed: {}", peer_addr, e),
            }
        });
    }

    /// Handshaking done: admit the client or turn it away.
    fn on_ready(&mut self, ready: Ready) {
        let Ready { conn, hello } = ready;
        let peer_addr = conn.peer_addr();

        if let Some(old) = self.sessions.remove(&hello.client) {
            warn!(
                "Client name collision: '{}' already connected from {} (session {}), replacing with {}",
                hello.client, old.peer_addr, old.id, peer_addr
            );
            let _ = self.dispatcher.disconnect(&old.client, old.id);
            self.reaper.retire(old);
        } else if self.sessions.len() >= self.config.max_clients {
            warn!(
                "Max clients ({}) reached, rejecting '{}' from {}",
                self.config.max_clients, hello.client, peer_addr
            );
            poison(conn, "too many clients");
            return;
        }

        let id = self.next_session_id;
        self.next_session_id += 1;

        let (outbound_tx, outbound_rx) = mpsc::channel(dispatcher::OUTBOUND_QUEUE_DEPTH);
        if self
            .dispatcher
            .connect(
                &hello.client,
                id,
                hello.mode,
                hello.consolidation_period,
                outbound_tx,
            )
            .is_err()
        {
            error!("Dispatcher unavailable, rejecting '{}'", hello.client);
            poison(conn, "broker shutting down");
            return;
        }

        let skew = if hello.time > 0.0 {
            self.clock.now() - hello.time
        } else {
            0.0
        };
        let welcome = Frame::Welcome {
            community: self.config.community.clone(),
            skew,
            asynchronous: true,
        };

        let session = LiveSession::spawn(
            conn,
            session::SessionParams {
                id,
                client: hello.client.clone(),
                mode: hello.mode,
                welcome,
                idle_timeout: self.config.client_timeout(),
                dispatcher: self.dispatcher.clone(),
                outbound: outbound_rx,
                events: self.events_tx.clone(),
            },
        );
        info!(
            "Client '{}' connected from {} ({}, session {})",
            hello.client, peer_addr, hello.mode, id
        );

        self.sessions.insert(hello.client, session);
        self.client_count.store(self.sessions.len(), Ordering::SeqCst);
    }

    /// Session ended on its own: purge, then reap.
    fn on_closed(&mut self, client: &str, session_id: u64, reason: CloseReason) {
        let current = self
            .sessions
            .get(client)
            .map_or(false, |s| s.id == session_id);
        if !current {
            debug!(
                "Ignoring close of replaced session {} for '{}'",
                session_id, client
            );
            return;
        }

        if let Some(session) = self.sessions.remove(client) {
            info!("Client '{}' disconnected: {}", client, reason);
            let _ = self.dispatcher.disconnect(client, session_id);
            self.reaper.retire(session);
            self.client_count.store(self.sessions.len(), Ordering::SeqCst);
        }
    }
}

/// Refuse a connection with a reason, then close it.
fn poison(mut conn: ClientConnection, reason: &'static str) {
    tokio::spawn(async move {
        let _ = conn.write_frame(&Frame::poison(reason)).await;
    });
}

/// Broker error types.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Bind error: {0}")]
    Bind(String),
    #[error("Broker already running")]
    AlreadyRunning,
    #[error("Broker not running")]
    NotRunning,
    #[error("Broker already stopped")]
    Stopped,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<ConnectionError> for BrokerError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(s) => Self::Io(s),
            ConnectionError::Protocol(s) => Self::Protocol(s),
        }
    }
}

impl From<DispatcherClosed> for BrokerError {
    fn from(_: DispatcherClosed) -> Self {
        Self::NotRunning
    }
}
