// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client connection handling.
//!
//! A [`ClientConnection`] owns a TCP stream during the handshake and is then
//! split into a [`FrameReader`] and a [`FrameWriter`] so that asynchronous
//! sessions can read and write from separate tasks.

use super::protocol::{Frame, ProtocolError};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Reads length-prefixed JSON frames.
pub struct FrameReader<R> {
    inner: R,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read a frame.
    ///
    /// Returns `Ok(None)` if the connection is closed gracefully.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        // Read length prefix (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None); // Connection closed
            }
            Err(e) => return Err(ConnectionError::Io(e.to_string())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(ConnectionError::Protocol("Empty frame".into()));
        }
        if len > self.max_message_size {
            return Err(ConnectionError::Protocol(format!(
                "Frame too large: {} > {}",
                len, self.max_message_size
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);

        self.inner
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let frame: Frame = serde_json::from_slice(&self.read_buffer)
            .map_err(|e| ConnectionError::Protocol(format!("Invalid JSON: {}", e)))?;

        Ok(Some(frame))
    }
}

/// Writes length-prefixed JSON frames.
pub struct FrameWriter<W> {
    inner: W,
    max_message_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
        }
    }

    /// Send a frame and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let json = serde_json::to_vec(frame)
            .map_err(|e| ConnectionError::Protocol(format!("Serialize error: {}", e)))?;

        if json.len() > self.max_message_size {
            return Err(ConnectionError::Protocol(format!(
                "Frame too large: {} > {}",
                json.len(),
                self.max_message_size
            )));
        }

        let len = json.len() as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&json).await?;
        self.inner.flush().await?;

        Ok(())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }
}

/// A connected client, not yet split.
pub struct ClientConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    peer_addr: SocketAddr,
}

impl ClientConnection {
    /// Wrap an accepted stream.
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_message_size: usize,
        nodelay: bool,
    ) -> Self {
        if nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
            }
        }
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half, max_message_size),
            writer: FrameWriter::new(write_half, max_message_size),
            peer_addr,
        }
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read a frame from the client.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        self.reader.read_frame().await
    }

    /// Send a frame to the client.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        self.writer.write_frame(frame).await
    }

    /// Separate read and write halves.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
