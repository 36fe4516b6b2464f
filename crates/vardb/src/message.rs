// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker message model.
//!
//! A client exchange is a batch ("packet") of [`Message`]s in each direction.
//! Writes to a variable travel as [`Notification`]s; administrative query
//! results are also returned as notifications under reserved keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved key for the "dump every variable" server request.
pub const REQUEST_ALL: &str = "ALL";
/// Reserved key for the per-client published/subscribed summary.
pub const REQUEST_PROC_SUMMARY: &str = "PROC_SUMMARY";
/// Reserved key for the list of all variable names.
pub const REQUEST_VAR_SUMMARY: &str = "VAR_SUMMARY";
/// Reserved key for the "reset every variable" server request.
pub const REQUEST_DB_CLEAR: &str = "DB_CLEAR";

/// Broker time, refreshed at 1 Hz.
pub const VAR_DB_TIME: &str = "DB_TIME";
/// Seconds since broker start (or since the last DB_CLEAR), refreshed at 1 Hz.
pub const VAR_DB_UPTIME: &str = "DB_UPTIME";
/// Comma-joined connected client names, refreshed at 0.5 Hz.
pub const VAR_DB_CLIENTS: &str = "DB_CLIENTS";
/// Connect/disconnect events.
pub const VAR_DB_EVENT: &str = "DB_EVENT";
/// Human readable table of every variable.
pub const VAR_DB_VARSUMMARY: &str = "DB_VARSUMMARY";
/// Who reads and writes what.
pub const VAR_DB_RWSUMMARY: &str = "DB_RWSUMMARY";

/// Type of a variable's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Registered for but never written.
    NotSet,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
}

impl DataType {
    /// Single character code used in summaries.
    pub fn code(self) -> char {
        match self {
            Self::NotSet => '~',
            Self::Double => 'D',
            Self::String => 'S',
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSet => write!(f, "not-set"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
        }
    }
}

/// A variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Double(f64),
    String(String),
}

impl Value {
    /// Type tag of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Double(_) => DataType::Double,
            Self::String(_) => DataType::String,
        }
    }

    /// Numeric payload, if any.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::String(_) => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Double(_) => None,
            Self::String(s) => Some(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Double(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A write to a named variable, or a delivery of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Variable name.
    pub key: String,
    /// New value.
    pub value: Value,
    /// Caller-supplied logical time (may differ from wall clock under warp).
    #[serde(default)]
    pub time: f64,
    /// Writing client.
    #[serde(default)]
    pub source: String,
    /// Auxiliary provenance supplied by the writer.
    #[serde(default)]
    pub source_aux: String,
    /// Community that first produced this value. Empty on the first hop.
    #[serde(default)]
    pub community: String,
}

impl Notification {
    /// Create a notification with empty provenance.
    pub fn new(key: impl Into<String>, value: impl Into<Value>, time: f64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time,
            source: String::new(),
            source_aux: String::new(),
            community: String::new(),
        }
    }

    /// Set the writing client.
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Type of the carried value.
    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

/// Protocol message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Subscribe `client` to `key`, delivering at most once per `period` seconds.
    Register {
        key: String,
        client: String,
        #[serde(default)]
        period: f64,
    },

    /// Drop `client`'s subscription to `key`.
    Unregister { key: String, client: String },

    /// Subscribe to every variable matching the patterns, now and in future.
    WildcardRegister {
        client: String,
        #[serde(default)]
        var_pattern: String,
        #[serde(default)]
        app_pattern: String,
        #[serde(default)]
        period: f64,
    },

    /// Undo a previous wildcard registration.
    WildcardUnregister {
        client: String,
        #[serde(default)]
        var_pattern: String,
        #[serde(default)]
        app_pattern: String,
    },

    /// Variable write (inbound) or delivery (outbound).
    Notify(Notification),

    /// Administrative query: ALL, PROC_SUMMARY, VAR_SUMMARY or DB_CLEAR.
    ServerRequest { key: String },

    /// Keepalive. Outbound, `time` is the broker's local time.
    Null {
        #[serde(default)]
        time: f64,
    },

    /// Keepalive for asynchronous clients carrying a suggested send period.
    Timing {
        time: f64,
        consolidation_period: f64,
    },
}

impl Message {
    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::WildcardRegister { .. } => "wildcard_register",
            Self::WildcardUnregister { .. } => "wildcard_unregister",
            Self::Notify(_) => "notify",
            Self::ServerRequest { .. } => "server_request",
            Self::Null { .. } => "null",
            Self::Timing { .. } => "timing",
        }
    }

    /// True for variable writes.
    pub fn is_notify(&self) -> bool {
        matches!(self, Self::Notify(_))
    }

    /// The carried notification, if this is a NOTIFY.
    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Self::Notify(n) => Some(n),
            _ => None,
        }
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notify(n)
    }
}
