// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! vardb - variable broker
//!
//! A publish/subscribe rendezvous server for distributed robotics processes.
//! Clients write named variables (doubles or strings), subscribe to
//! variables with an optional throttle period, and receive the writes they
//! subscribed to either on their next poll (synchronous clients) or pushed
//! as soon as they happen (asynchronous clients).
//!
//! # Architecture
//!
//! ```text
//!  accept ──► handshake ──► session worker(s) ──► dispatcher ──► database
//!                                 ▲                   │
//!                                 └── outbound queue ◄┘
//!  closed sessions ──► reaper
//! ```
//!
//! - [`db::Database`] holds every variable, subscription and held-mail
//!   outbox. Only the dispatcher task mutates it.
//! - [`server::Broker`] owns the accept loop and the public API.
//!
//! # Example
//!
//! ```no_run
//! use vardb::{Broker, BrokerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new(BrokerConfig::default()).await?;
//! broker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod message;
pub mod outbox;
pub mod server;
pub mod subscription;
pub mod time;
pub mod variable;

pub use config::{BrokerConfig, ConfigError};
pub use db::{ApplyError, Database};
pub use message::{DataType, Message, Notification, Value};
pub use server::{Broker, BrokerError, Frame, SessionMode};
pub use variable::Variable;
