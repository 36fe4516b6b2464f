// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client session workers.
//!
//! A synchronous session is one task running read, forward, wait, reply.
//! An asynchronous session is a reader task that forwards every packet
//! without waiting, plus a writer task that drains the session's outbound
//! queue whenever the dispatcher pushes. Both kinds watch an idle timeout
//! and a stop flag, and report their end to the connection manager.

use super::connection::{ClientConnection, ConnectionError, FrameReader, FrameWriter};
use super::dispatcher::DispatcherHandle;
use super::protocol::{Frame, ProtocolError, SessionMode};
use crate::message::Message;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepting,
    Handshaking,
    Active(SessionMode),
    Closing,
    Reaped,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `disconnect`.
    ClientDisconnect,
    /// Peer closed the socket.
    Eof,
    /// No traffic within the idle timeout.
    IdleTimeout,
    /// Socket error.
    Io(String),
    /// Malformed or unexpected frame.
    Protocol(String),
    /// Stop flag raised by the broker.
    Stopped,
    /// Dispatcher no longer accepting work.
    DispatcherGone,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnect => write!(f, "client disconnect"),
            Self::Eof => write!(f, "connection closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Stopped => write!(f, "stopped"),
            Self::DispatcherGone => write!(f, "dispatcher gone"),
        }
    }
}

impl From<ConnectionError> for CloseReason {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(s) => Self::Io(s),
            ConnectionError::Protocol(s) => Self::Protocol(s),
        }
    }
}

/// Notifications from sessions to the connection manager.
#[derive(Debug)]
pub enum SessionEvent {
    Closed {
        client: String,
        session_id: u64,
        reason: CloseReason,
    },
}

/// Validated `hello`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub client: String,
    pub mode: SessionMode,
    pub time: f64,
    pub consolidation_period: f64,
}

/// Read and validate the client's `hello`.
///
/// An empty client name is answered with `poison`.
pub async fn handshake(
    conn: &mut ClientConnection,
    timeout: Duration,
) -> Result<Hello, ConnectionError> {
    let frame = match tokio::time::timeout(timeout, conn.read_frame()).await {
        Ok(result) => result?,
        Err(_) => return Err(ProtocolError::HandshakeTimeout.into()),
    };

    match frame {
        Some(Frame::Hello {
            client,
            mode,
            time,
            consolidation_period,
        }) => {
            let client = client.trim().to_string();
            if client.is_empty() {
                let _ = conn.write_frame(&Frame::poison("empty client name")).await;
                return Err(ProtocolError::EmptyClientName.into());
            }
            Ok(Hello {
                client,
                mode,
                time,
                consolidation_period,
            })
        }
        Some(other) => {
            let _ = conn.write_frame(&Frame::poison("expected hello")).await;
            Err(ProtocolError::UnexpectedFrame {
                expected: "hello",
                got: other.name(),
            }
            .into())
        }
        None => Err(ProtocolError::ClosedDuringHandshake.into()),
    }
}

/// Everything a session worker needs.
pub struct SessionParams {
    pub id: u64,
    pub client: String,
    pub mode: SessionMode,
    /// First frame written to the client.
    pub welcome: Frame,
    pub idle_timeout: Duration,
    pub dispatcher: DispatcherHandle,
    pub outbound: mpsc::Receiver<Vec<Message>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Handle to a running session, owned by the manager and then the reaper.
pub struct LiveSession {
    pub id: u64,
    pub client: String,
    pub mode: SessionMode,
    pub peer_addr: SocketAddr,
    state: SessionState,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}

impl LiveSession {
    /// Spawn the worker task(s) for an accepted, named connection.
    pub fn spawn(conn: ClientConnection, params: SessionParams) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let peer_addr = conn.peer_addr();
        let (reader, writer) = conn.into_split();
        let id = params.id;
        let client = params.client.clone();
        let mode = params.mode;

        let tasks = match mode {
            SessionMode::Synchronous => {
                vec![tokio::spawn(run_sync(reader, writer, params, stop_rx))]
            }
            SessionMode::Asynchronous => spawn_async(reader, writer, params, stop_rx),
        };

        Self {
            id,
            client,
            mode,
            peer_addr,
            state: SessionState::Active(mode),
            stop,
            tasks,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session around arbitrary tasks, which get the stop flag to watch.
    #[cfg(test)]
    pub(crate) fn with_tasks<F>(id: u64, client: &str, spawn: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Vec<JoinHandle<()>>,
    {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            id,
            client: client.to_string(),
            mode: SessionMode::Synchronous,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            state: SessionState::Active(SessionMode::Synchronous),
            stop,
            tasks: spawn(stop_rx),
        }
    }

    /// Raise the stop flag.
    pub fn begin_close(&mut self) {
        if self.state != SessionState::Reaped {
            self.state = SessionState::Closing;
        }
        let _ = self.stop.send(true);
    }

    /// Stop the session and release its tasks.
    ///
    /// Tasks get `grace` to finish on their own, then are aborted.
    /// Returns the number of tasks that had to be aborted.
    pub async fn reap(&mut self, grace: Duration) -> usize {
        self.begin_close();
        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for task in self.tasks.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        self.tasks.clear();
        self.state = SessionState::Reaped;
        aborted
    }
}

/// Wait for the stop flag. A dropped sender counts as stop.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

enum Inbound {
    Frame(Result<Option<Frame>, ConnectionError>),
    IdleTimeout,
    Stop,
}

async fn next_inbound<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
    stop: &mut watch::Receiver<bool>,
) -> Inbound {
    tokio::select! {
        _ = stopped(stop) => Inbound::Stop,
        result = tokio::time::timeout(idle_timeout, reader.read_frame()) => match result {
            Ok(frame) => Inbound::Frame(frame),
            Err(_) => Inbound::IdleTimeout,
        },
    }
}

async fn run_sync<R, W>(
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    params: SessionParams,
    mut stop: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let SessionParams {
        id,
        client,
        welcome,
        idle_timeout,
        dispatcher,
        mut outbound,
        events,
        ..
    } = params;

    let reason = match writer.write_frame(&welcome).await {
        Err(e) => CloseReason::from(e),
        Ok(()) => loop {
            let messages = match next_inbound(&mut reader, idle_timeout, &mut stop).await {
                Inbound::Stop => break CloseReason::Stopped,
                Inbound::IdleTimeout => break CloseReason::IdleTimeout,
                Inbound::Frame(Err(e)) => break e.into(),
                Inbound::Frame(Ok(None)) => break CloseReason::Eof,
                Inbound::Frame(Ok(Some(Frame::Disconnect))) => {
                    break CloseReason::ClientDisconnect
                }
                Inbound::Frame(Ok(Some(Frame::Packet { messages }))) => messages,
                Inbound::Frame(Ok(Some(other))) => {
                    break CloseReason::Protocol(format!("unexpected {} frame", other.name()))
                }
            };

            if dispatcher.packet(&client, id, messages).is_err() {
                break CloseReason::DispatcherGone;
            }

            let reply = tokio::select! {
                _ = stopped(&mut stop) => break CloseReason::Stopped,
                reply = outbound.recv() => reply,
            };
            let Some(reply) = reply else {
                break CloseReason::DispatcherGone;
            };
            if let Err(e) = writer.write_frame(&Frame::packet(reply)).await {
                break e.into();
            }
        },
    };

    let _ = writer.shutdown().await;
    report_closed(&events, client, id, reason);
}

fn spawn_async<R, W>(
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    params: SessionParams,
    stop: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let SessionParams {
        id,
        client,
        welcome,
        idle_timeout,
        dispatcher,
        outbound,
        events,
        ..
    } = params;

    let (halt_tx, halt_rx) = watch::channel(false);
    let (failed_tx, failed_rx) = oneshot::channel();
    let (written_tx, written_rx) = watch::channel(Instant::now());

    let writer_task = tokio::spawn(run_async_writer(
        writer,
        welcome,
        outbound,
        WriterSignals {
            stop: stop.clone(),
            halt: halt_rx,
            failed: failed_tx,
            last_write: written_tx,
        },
    ));
    let reader_task = tokio::spawn(async move {
        let signals = ReaderSignals {
            stop,
            writer_failed: failed_rx,
            last_write: written_rx,
        };
        let reason =
            run_async_reader(reader, &client, id, idle_timeout, &dispatcher, signals).await;
        let _ = halt_tx.send(true);
        report_closed(&events, client, id, reason);
    });

    vec![reader_task, writer_task]
}

/// What the async reader watches besides its socket.
struct ReaderSignals {
    stop: watch::Receiver<bool>,
    writer_failed: oneshot::Receiver<CloseReason>,
    last_write: watch::Receiver<Instant>,
}

/// Channels between the async writer and the rest of the session.
struct WriterSignals {
    stop: watch::Receiver<bool>,
    halt: watch::Receiver<bool>,
    failed: oneshot::Sender<CloseReason>,
    last_write: watch::Sender<Instant>,
}

async fn run_async_reader<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    client: &str,
    id: u64,
    idle_timeout: Duration,
    dispatcher: &DispatcherHandle,
    mut signals: ReaderSignals,
) -> CloseReason {
    loop {
        let frame = match next_async_inbound(&mut reader, idle_timeout, &mut signals).await {
            Ok(frame) => frame,
            Err(reason) => return reason,
        };

        match frame {
            None => return CloseReason::Eof,
            Some(Frame::Disconnect) => return CloseReason::ClientDisconnect,
            Some(Frame::Packet { messages }) => {
                if dispatcher.packet(client, id, messages).is_err() {
                    return CloseReason::DispatcherGone;
                }
            }
            Some(other) => {
                return CloseReason::Protocol(format!("unexpected {} frame", other.name()))
            }
        }
    }
}

/// Next frame of an async session.
///
/// The idle deadline runs from the later of the read start and the
/// writer's last successful write. The read itself is never cancelled
/// while the session stays open.
async fn next_async_inbound<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
    signals: &mut ReaderSignals,
) -> Result<Option<Frame>, CloseReason> {
    let started = Instant::now();
    let mut deadline = started + idle_timeout;
    let read = reader.read_frame();
    tokio::pin!(read);

    loop {
        tokio::select! {
            result = &mut read => return result.map_err(CloseReason::from),
            _ = stopped(&mut signals.stop) => return Err(CloseReason::Stopped),
            failed = &mut signals.writer_failed => {
                return Err(failed.unwrap_or(CloseReason::Stopped));
            }
            _ = tokio::time::sleep_until(deadline) => {
                let last_active = started.max(*signals.last_write.borrow());
                deadline = last_active + idle_timeout;
                if deadline <= Instant::now() {
                    return Err(CloseReason::IdleTimeout);
                }
            }
        }
    }
}

async fn run_async_writer<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    welcome: Frame,
    mut outbound: mpsc::Receiver<Vec<Message>>,
    signals: WriterSignals,
) {
    let WriterSignals {
        mut stop,
        mut halt,
        failed,
        last_write,
    } = signals;

    let failure = match writer.write_frame(&welcome).await {
        Err(e) => Some(CloseReason::from(e)),
        Ok(()) => loop {
            last_write.send_replace(Instant::now());
            let packet = tokio::select! {
                _ = stopped(&mut stop) => break None,
                _ = stopped(&mut halt) => break None,
                packet = outbound.recv() => packet,
            };
            let Some(packet) = packet else {
                break Some(CloseReason::DispatcherGone);
            };
            if let Err(e) = writer.write_frame(&Frame::packet(packet)).await {
                break Some(e.into());
            }
        },
    };

    if let Some(reason) = failure {
        let _ = failed.send(reason);
    }
    let _ = writer.shutdown().await;
}

fn report_closed(
    events: &mpsc::UnboundedSender<SessionEvent>,
    client: String,
    session_id: u64,
    reason: CloseReason,
) {
    match reason {
        CloseReason::IdleTimeout | CloseReason::Io(_) | CloseReason::Protocol(_) => {
            warn!("Session {} '{}' closing: {}", session_id, client, reason)
        }
        _ => debug!("Session {} '{}' closing: {}", session_id, client, reason),
    }
    let _ = events.send(SessionEvent::Closed {
        client,
        session_id,
        reason,
    });
}
