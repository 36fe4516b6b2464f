// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Variable records held by the store.

use crate::message::{DataType, Notification, Value};
use crate::subscription::Subscription;
use std::collections::{BTreeMap, BTreeSet};

/// Intervals longer than this reset the frequency estimate.
const FREQ_STALE_SECS: f64 = 5.0;
/// Intervals shorter than this count as the maximum frequency.
const FREQ_MIN_INTERVAL_SECS: f64 = 0.01;
/// Upper bound of the estimate.
const FREQ_MAX_HZ: f64 = 100.0;
/// IIR smoothing coefficient (weight of the previous estimate).
const FREQ_ALPHA: f64 = 0.7;

/// Exponentially smoothed event-rate estimator.
///
/// Used for variable write frequency and for client packet rates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateEstimator {
    last_event: Option<f64>,
    hz: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event at `now` (seconds) and return the updated estimate.
    pub fn record(&mut self, now: f64) -> f64 {
        if let Some(last) = self.last_event {
            let dt = now - last;
            if dt > FREQ_STALE_SECS {
                self.hz = 0.0;
            } else {
                let instant = if dt < FREQ_MIN_INTERVAL_SECS {
                    FREQ_MAX_HZ
                } else {
                    1.0 / dt
                };
                self.hz = (FREQ_ALPHA * self.hz + (1.0 - FREQ_ALPHA) * instant)
                    .clamp(0.0, FREQ_MAX_HZ);
            }
        }
        self.last_event = Some(now);
        self.hz
    }

    /// Current estimate in Hz.
    pub fn hz(&self) -> f64 {
        self.hz
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One named variable and everything the broker knows about it.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Stable identity key.
    pub name: String,
    /// Current value; `None` until first accepted write.
    pub value: Option<Value>,
    /// Committed type, `NotSet` until first accepted write.
    pub data_type: DataType,
    /// Last writer.
    pub writer: String,
    /// Last writer's auxiliary provenance.
    pub source_aux: String,
    /// Broker wall-clock time of the last write.
    pub written_at: f64,
    /// Caller-supplied time of the last write.
    pub time: f64,
    /// Community that first produced the current value.
    pub community: String,
    /// Accepted writes since creation or last reset.
    pub write_count: u64,
    /// Write-frequency estimate.
    pub write_rate: RateEstimator,
    /// Every client that has ever written this variable.
    pub writers: BTreeSet<String>,
    /// Client name → subscription.
    pub subscribers: BTreeMap<String, Subscription>,
}

impl Variable {
    /// New untyped, unwritten variable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            data_type: DataType::NotSet,
            writer: String::new(),
            source_aux: String::new(),
            written_at: 0.0,
            time: 0.0,
            community: String::new(),
            write_count: 0,
            write_rate: RateEstimator::new(),
            writers: BTreeSet::new(),
            subscribers: BTreeMap::new(),
        }
    }

    /// True once a write has committed a type.
    pub fn is_written(&self) -> bool {
        self.write_count > 0
    }

    /// Whether a write of `data_type` would be accepted.
    pub fn accepts(&self, data_type: DataType) -> bool {
        self.data_type == DataType::NotSet || self.data_type == data_type
    }

    /// Current write frequency in Hz.
    pub fn write_freq(&self) -> f64 {
        self.write_rate.hz()
    }

    /// Commit an accepted write. Caller has already checked [`accepts`](Self::accepts).
    pub fn write(&mut self, n: &Notification, now: f64) {
        self.data_type = n.data_type();
        self.value = Some(n.value.clone());
        self.writer = n.source.clone();
        self.source_aux = n.source_aux.clone();
        self.written_at = now;
        self.time = n.time;
        self.community = n.community.clone();
        self.writers.insert(n.source.clone());
        self.write_count += 1;
        self.write_rate.record(now);
    }

    /// Subscribe `client`, replacing any existing entry.
    ///
    /// Returns false for an empty client name.
    pub fn add_subscriber(&mut self, client: &str, period: f64) -> bool {
        if client.is_empty() {
            return false;
        }
        self.subscribers
            .insert(client.to_string(), Subscription::new(client, period));
        true
    }

    /// Remove `client`'s subscription. Returns true if one existed.
    pub fn remove_subscriber(&mut self, client: &str) -> bool {
        self.subscribers.remove(client).is_some()
    }

    pub fn is_subscribed(&self, client: &str) -> bool {
        self.subscribers.contains_key(client)
    }

    /// Return to the unwritten state, keeping name and subscribers.
    pub fn reset(&mut self) {
        let name = std::mem::take(&mut self.name);
        let subscribers = std::mem::take(&mut self.subscribers);
        *self = Self::new(name);
        self.subscribers = subscribers;
    }

    /// Build a notification carrying the current value, if any.
    pub fn to_notification(&self) -> Option<Notification> {
        let value = self.value.clone()?;
        Some(Notification {
            key: self.name.clone(),
            value,
            time: self.time,
            source: self.writer.clone(),
            source_aux: self.source_aux.clone(),
            community: self.community.clone(),
        })
    }
}
