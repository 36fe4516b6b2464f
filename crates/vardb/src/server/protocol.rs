// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker wire protocol.
//!
//! Length-prefixed JSON frames. The first frame from a client is `hello`;
//! the broker answers `welcome` (or `poison` and closes). After that both
//! sides exchange `packet` frames carrying batches of [`Message`]s.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How a client talks to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Request/reply: every packet gets exactly one reply packet.
    #[default]
    Synchronous,
    /// Full duplex: the broker may push packets at any time.
    Asynchronous,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synchronous => write!(f, "sync"),
            Self::Asynchronous => write!(f, "async"),
        }
    }
}

/// Protocol frame types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client introduces itself.
    #[serde(rename = "hello")]
    Hello {
        client: String,
        #[serde(default)]
        mode: SessionMode,
        /// Client's clock, used to report skew.
        #[serde(default)]
        time: f64,
        /// Send period the client would like to use (seconds).
        #[serde(default)]
        consolidation_period: f64,
    },

    /// Broker accepts the client.
    #[serde(rename = "welcome")]
    Welcome {
        community: String,
        /// Broker time minus client time.
        skew: f64,
        /// Whether the broker can push to asynchronous clients.
        asynchronous: bool,
    },

    /// Broker refuses the client; the connection is closed after this.
    #[serde(rename = "poison")]
    Poison { reason: String },

    /// Batch of messages in either direction.
    #[serde(rename = "packet")]
    Packet { messages: Vec<Message> },

    /// Client is leaving.
    #[serde(rename = "disconnect")]
    Disconnect,
}

impl Frame {
    /// Build a packet frame.
    pub fn packet(messages: Vec<Message>) -> Self {
        Self::Packet { messages }
    }

    /// Build a poison frame.
    pub fn poison(reason: impl Into<String>) -> Self {
        Self::Poison {
            reason: reason.into(),
        }
    }

    /// Frame type name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Poison { .. } => "poison",
            Self::Packet { .. } => "packet",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Handshake/protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Empty client name")]
    EmptyClientName,

    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("Handshake timed out")]
    HandshakeTimeout,
}
