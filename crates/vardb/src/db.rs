// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Variable store and notification dispatch.
//!
//! [`Database`] owns every [`Variable`], the wildcard filters and the
//! held-mail [`Outboxes`]. It is purely synchronous: the caller supplies the
//! current broker time and the list of connected clients, which keeps the
//! whole store deterministic under test. In the running broker it is owned
//! by the dispatcher task and nothing else touches it.

use crate::message::{
    DataType, Message, Notification, Value, REQUEST_ALL, REQUEST_DB_CLEAR, REQUEST_PROC_SUMMARY,
    REQUEST_VAR_SUMMARY, VAR_DB_CLIENTS, VAR_DB_EVENT, VAR_DB_RWSUMMARY, VAR_DB_TIME,
    VAR_DB_UPTIME, VAR_DB_VARSUMMARY,
};
use crate::outbox::Outboxes;
use crate::subscription::WildcardFilter;
use crate::variable::Variable;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, info};

/// DB_TIME / DB_UPTIME refresh period (seconds).
const TIME_REFRESH_PERIOD: f64 = 1.0;
/// DB_CLIENTS and summary refresh period (seconds).
const SUMMARY_REFRESH_PERIOD: f64 = 2.0;
/// Longest string value shown verbatim in DB_VARSUMMARY.
const SUMMARY_PREVIEW_CHARS: usize = 25;

/// Why a message was not applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("type mismatch on '{key}': variable is {expected}, write from '{client}' is {found}")]
    TypeMismatch {
        key: String,
        expected: DataType,
        found: DataType,
        client: String,
    },

    #[error("{0} with empty client name")]
    EmptyClient(&'static str),

    #[error("unknown server request '{0}'")]
    UnknownRequest(String),

    #[error("{kind} for '{claimed}' sent by '{client}'")]
    ForeignClient {
        kind: &'static str,
        claimed: String,
        client: String,
    },
}

/// Store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Accepted writes.
    pub writes: u64,
    /// Writes rejected for type mismatch.
    pub rejected: u64,
    /// Notifications queued to subscribers.
    pub deliveries: u64,
}

/// The variable store.
#[derive(Debug)]
pub struct Database {
    community: String,
    db_name: String,
    vars: BTreeMap<String, Variable>,
    filters: HashMap<String, Vec<WildcardFilter>>,
    outboxes: Outboxes,
    start_time: f64,
    last_time_refresh: f64,
    last_summary_refresh: f64,
    stats: DbStats,
}

impl Database {
    /// Create an empty store.
    ///
    /// `db_name` is the writer recorded on the broker's own variables.
    pub fn new(
        community: impl Into<String>,
        db_name: impl Into<String>,
        max_held_mail: usize,
        now: f64,
    ) -> Self {
        Self {
            community: community.into(),
            db_name: db_name.into(),
            vars: BTreeMap::new(),
            filters: HashMap::new(),
            outboxes: Outboxes::new(max_held_mail),
            start_time: now,
            last_time_refresh: f64::NEG_INFINITY,
            last_summary_refresh: f64::NEG_INFINITY,
            stats: DbStats::default(),
        }
    }

    /// Community this store belongs to.
    pub fn community(&self) -> &str {
        &self.community
    }

    /// Apply one inbound message from `from_client`.
    ///
    /// Direct answers (server request results) are appended to `replies`;
    /// notifications for subscribers go to their outboxes. Subscription
    /// changes may only name `from_client` itself.
    pub fn apply(
        &mut self,
        msg: Message,
        from_client: &str,
        clients: &[String],
        now: f64,
        replies: &mut Vec<Message>,
    ) -> Result<(), ApplyError> {
        match msg {
            Message::Notify(mut n) => {
                if n.source.is_empty() {
                    n.source = from_client.to_string();
                }
                self.notify(n, now)
            }
            Message::Register {
                key,
                client,
                period,
            } => {
                own_client("register", &client, from_client)?;
                self.register(&key, &client, period, now)
            }
            Message::Unregister { key, client } => {
                own_client("unregister", &client, from_client)?;
                self.unregister(&key, &client);
                Ok(())
            }
            Message::WildcardRegister {
                client,
                var_pattern,
                app_pattern,
                period,
            } => {
                own_client("wildcard register", &client, from_client)?;
                self.wildcard_register(
                    &client,
                    WildcardFilter::new(var_pattern, app_pattern, period),
                    now,
                )
            }
            Message::WildcardUnregister {
                client,
                var_pattern,
                app_pattern,
            } => {
                own_client("wildcard unregister", &client, from_client)?;
                self.wildcard_unregister(&client, &var_pattern, &app_pattern);
                Ok(())
            }
            Message::ServerRequest { key } => self.server_request(&key, clients, now, replies),
            Message::Null { .. } | Message::Timing { .. } => Ok(()),
        }
    }

    /// Write a variable and queue notifications to due subscribers.
    pub fn notify(&mut self, mut n: Notification, now: f64) -> Result<(), ApplyError> {
        let var = self
            .vars
            .entry(n.key.clone())
            .or_insert_with(|| Variable::new(n.key.clone()));

        let found = n.data_type();
        if !var.accepts(found) {
            self.stats.rejected += 1;
            return Err(ApplyError::TypeMismatch {
                key: n.key,
                expected: var.data_type,
                found,
                client: n.source,
            });
        }

        if !var.is_written() {
            for (client, filters) in &self.filters {
                if let Some(f) = filters
                    .iter()
                    .find(|f| f.matches(&n.key, Some(n.source.as_str())))
                {
                    debug!(
                        "'{}' subscribed to '{}' via wildcard {}:{}",
                        client, n.key, f.var_pattern, f.app_pattern
                    );
                    var.add_subscriber(client, f.period);
                }
            }
        }

        if n.community.is_empty() {
            n.community = self.community.clone();
        }

        var.write(&n, now);
        self.stats.writes += 1;

        let msg = Message::Notify(n);
        for sub in var.subscribers.values_mut() {
            if sub.expired(now) {
                self.outboxes.push(&sub.client, msg.clone());
                sub.mark_delivered(now);
                self.stats.deliveries += 1;
            }
        }
        Ok(())
    }

    /// Subscribe `client` to `key`.
    ///
    /// If the variable already holds a value the client gets it immediately.
    pub fn register(
        &mut self,
        key: &str,
        client: &str,
        period: f64,
        now: f64,
    ) -> Result<(), ApplyError> {
        if client.is_empty() {
            return Err(ApplyError::EmptyClient("register"));
        }

        let var = self
            .vars
            .entry(key.to_string())
            .or_insert_with(|| Variable::new(key));
        var.add_subscriber(client, period);

        if let Some(current) = var.to_notification() {
            self.outboxes.push(client, Message::Notify(current));
            self.stats.deliveries += 1;
            if let Some(sub) = var.subscribers.get_mut(client) {
                sub.mark_delivered(now);
            }
        }
        debug!("'{}' registered for '{}' @ {:.2}s", client, key, period);
        Ok(())
    }

    /// Drop `client`'s subscription to `key`. Unknown names are ignored.
    pub fn unregister(&mut self, key: &str, client: &str) {
        if let Some(var) = self.vars.get_mut(key) {
            if var.remove_subscriber(client) {
                debug!("'{}' unregistered from '{}'", client, key);
            }
        }
    }

    /// Store a wildcard filter and subscribe to every existing match.
    pub fn wildcard_register(
        &mut self,
        client: &str,
        filter: WildcardFilter,
        now: f64,
    ) -> Result<(), ApplyError> {
        if client.is_empty() {
            return Err(ApplyError::EmptyClient("wildcard register"));
        }

        let matching: Vec<String> = self
            .vars
            .values()
            .filter(|v| filter.matches(&v.name, written_by(v)))
            .map(|v| v.name.clone())
            .collect();

        let period = filter.period;
        let filters = self.filters.entry(client.to_string()).or_default();
        filters.retain(|f| !f.same_patterns(&filter.var_pattern, &filter.app_pattern));
        filters.push(filter);

        for key in matching {
            self.register(&key, client, period, now)?;
        }
        Ok(())
    }

    /// Remove a wildcard filter and every subscription it matches.
    pub fn wildcard_unregister(&mut self, client: &str, var_pattern: &str, app_pattern: &str) {
        if let Some(filters) = self.filters.get_mut(client) {
            filters.retain(|f| !f.same_patterns(var_pattern, app_pattern));
        }

        let filter = WildcardFilter::new(var_pattern, app_pattern, 0.0);
        for var in self.vars.values_mut() {
            if filter.matches(&var.name, written_by(var)) {
                var.remove_subscriber(client);
            }
        }
    }

    /// Answer an administrative query.
    pub fn server_request(
        &mut self,
        key: &str,
        clients: &[String],
        now: f64,
        replies: &mut Vec<Message>,
    ) -> Result<(), ApplyError> {
        match key {
            REQUEST_ALL => {
                replies.extend(
                    self.vars
                        .values()
                        .filter_map(Variable::to_notification)
                        .map(Message::Notify),
                );
            }
            REQUEST_PROC_SUMMARY => {
                for client in clients {
                    let summary = self.process_summary(client);
                    replies.push(self.own_notification(REQUEST_PROC_SUMMARY, summary, now));
                }
            }
            REQUEST_VAR_SUMMARY => {
                let names: Vec<&str> = self.vars.keys().map(String::as_str).collect();
                replies.push(self.own_notification(REQUEST_VAR_SUMMARY, names.join(","), now));
            }
            REQUEST_DB_CLEAR => self.clear(now),
            other => return Err(ApplyError::UnknownRequest(other.to_string())),
        }
        Ok(())
    }

    /// Reset every variable and discard all held mail.
    pub fn clear(&mut self, now: f64) {
        info!("Clearing {} variables and all held mail", self.vars.len());
        for var in self.vars.values_mut() {
            var.reset();
        }
        self.outboxes.clear_all();
        self.start_time = now;
    }

    /// A client joined: open its outbox and announce it.
    pub fn connect(&mut self, client: &str, now: f64) {
        self.outboxes.open(client);
        self.notify_self(VAR_DB_EVENT, format!("connected={}", client), now);
    }

    /// A client left: purge its subscriptions, filters and mail.
    pub fn disconnect(&mut self, client: &str, now: f64) {
        let mut removed = 0usize;
        for var in self.vars.values_mut() {
            if var.remove_subscriber(client) {
                removed += 1;
            }
        }
        self.filters.remove(client);
        let dropped = self.outboxes.remove(client).map_or(0, |m| m.len());

        debug!(
            "Purged '{}': {} subscriptions, {} held messages",
            client, removed, dropped
        );
        self.notify_self(VAR_DB_EVENT, format!("disconnected={}", client), now);
    }

    /// Take every pending message for `client`.
    pub fn take_mail(&mut self, client: &str) -> Vec<Message> {
        self.outboxes.take(client)
    }

    /// Whether `client` has pending mail.
    pub fn has_mail(&self, client: &str) -> bool {
        self.outboxes.has_mail(client)
    }

    /// Whether `client` has an outbox.
    pub fn has_outbox(&self, client: &str) -> bool {
        self.outboxes.contains(client)
    }

    /// Refresh the broker's own variables when their period has elapsed.
    pub fn refresh_self_variables(&mut self, now: f64, clients: &[String]) {
        if now - self.last_time_refresh >= TIME_REFRESH_PERIOD {
            self.last_time_refresh = now;
            self.notify_self(VAR_DB_TIME, now, now);
            self.notify_self(VAR_DB_UPTIME, now - self.start_time, now);
        }

        if now - self.last_summary_refresh >= SUMMARY_REFRESH_PERIOD {
            self.last_summary_refresh = now;
            self.notify_self(VAR_DB_CLIENTS, clients.join(","), now);
            let var_summary = self.var_summary();
            self.notify_self(VAR_DB_VARSUMMARY, var_summary, now);
            let rw_summary = self.rw_summary(clients);
            self.notify_self(VAR_DB_RWSUMMARY, rw_summary, now);
        }
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&Variable> {
        self.vars.get(key)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variables `client` is subscribed to.
    pub fn subscriptions_of(&self, client: &str) -> Vec<&str> {
        self.vars
            .values()
            .filter(|v| v.is_subscribed(client))
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Seconds since start or the last clear.
    pub fn uptime(&self, now: f64) -> f64 {
        now - self.start_time
    }

    pub fn stats(&self) -> &DbStats {
        &self.stats
    }

    fn own_notification(&self, key: &str, value: impl Into<Value>, now: f64) -> Message {
        let mut n = Notification::new(key, value, now).from_source(self.db_name.clone());
        n.community = self.community.clone();
        Message::Notify(n)
    }

    fn notify_self(&mut self, key: &str, value: impl Into<Value>, now: f64) {
        let mut n = Notification::new(key, value, now).from_source(self.db_name.clone());
        n.community = self.community.clone();
        if let Err(e) = self.notify(n, now) {
            debug!("Self-variable update rejected: {}", e);
        }
    }

    fn process_summary(&self, client: &str) -> String {
        let subscribed: Vec<&str> = self.subscriptions_of(client);
        let published: Vec<&str> = self
            .vars
            .values()
            .filter(|v| v.writers.contains(client))
            .map(|v| v.name.as_str())
            .collect();
        format!(
            "{}:SUBSCRIBED={},PUBLISHED={}",
            client,
            subscribed.join(","),
            published.join(",")
        )
    }

    fn var_summary(&self) -> String {
        let mut out = String::new();
        for var in self.vars.values() {
            let writer = if var.writer.is_empty() {
                "(write pending)"
            } else {
                var.writer.as_str()
            };
            let _ = writeln!(
                out,
                "{:<20} {:<20} {:>5.1}Hz {} {}",
                var.name,
                writer,
                var.write_freq(),
                var.data_type.code(),
                preview(var.value.as_ref())
            );
        }
        out
    }

    fn rw_summary(&self, clients: &[String]) -> String {
        let mut entries = Vec::with_capacity(clients.len());
        for client in clients {
            let subscribed = self.subscriptions_of(client);
            let published: Vec<&str> = self
                .vars
                .values()
                .filter(|v| v.writers.contains(client.as_str()))
                .map(|v| v.name.as_str())
                .collect();
            entries.push(format!(
                "{}={}&{}",
                client,
                subscribed.join(":"),
                published.join(":")
            ));
        }
        entries.join(",")
    }
}

/// A non-empty `claimed` name must be the sender's own.
fn own_client(kind: &'static str, claimed: &str, from_client: &str) -> Result<(), ApplyError> {
    if claimed.is_empty() || claimed == from_client {
        Ok(())
    } else {
        Err(ApplyError::ForeignClient {
            kind,
            claimed: claimed.to_string(),
            client: from_client.to_string(),
        })
    }
}

fn written_by(var: &Variable) -> Option<&str> {
    if var.is_written() {
        Some(var.writer.as_str())
    } else {
        None
    }
}

fn preview(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Double(v)) => v.to_string(),
        Some(Value::String(s)) if s.chars().count() > SUMMARY_PREVIEW_CHARS => {
            let head: String = s.chars().take(SUMMARY_PREVIEW_CHARS - 3).collect();
            format!("{}...", head)
        }
        Some(Value::String(s)) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new("#1", "VARDB_#1", 1000, 0.0)
    }

    fn write(db: &mut Database, key: &str, value: impl Into<Value>, src: &str, now: f64) {
        db.notify(Notification::new(key, value, now).from_source(src), now)
            .unwrap();
    }

    fn notified(mail: &[Message], key: &str) -> Vec<Notification> {
        mail.iter()
            .filter_map(Message::as_notification)
            .filter(|n| n.key == key)
            .cloned()
            .collect()
    }

    #[test]
    fn test_subscribe_then_write_delivers() {
        let mut db = db();
        db.register("TEMP", "A", 0.0, 0.0).unwrap();
        write(&mut db, "TEMP", 21.5, "B", 0.1);

        let mail = db.take_mail("A");
        let temps = notified(&mail, "TEMP");
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].value, Value::Double(21.5));
        assert_eq!(temps[0].source, "B");
        assert_eq!(temps[0].community, "#1");
    }

    #[test]
    fn test_type_stability() {
        let mut db = db();
        write(&mut db, "COUNT", "abc", "C", 0.0);

        let err = db
            .notify(Notification::new("COUNT", 3.0, 1.0).from_source("C"), 1.0)
            .unwrap_err();
        assert!(matches!(err, ApplyError::TypeMismatch { .. }));

        let var = db.get("COUNT").unwrap();
        assert_eq!(var.data_type, DataType::String);
        assert_eq!(var.value, Some(Value::from("abc")));
        assert_eq!(var.write_count, 1);
        assert_eq!(db.stats().rejected, 1);
    }

    #[test]
    fn test_rejected_write_notifies_nobody() {
        let mut db = db();
        write(&mut db, "COUNT", "abc", "C", 0.0);
        db.register("COUNT", "A", 0.0, 0.0).unwrap();
        db.take_mail("A");

        assert!(db
            .notify(Notification::new("COUNT", 1.0, 1.0).from_source("C"), 1.0)
            .is_err());
        assert!(db.take_mail("A").is_empty());
    }

    #[test]
    fn test_throttle() {
        let mut db = db();
        db.register("TEMP", "A", 2.0, 0.0).unwrap();
        write(&mut db, "TEMP", 1.0, "B", 0.0);
        write(&mut db, "TEMP", 2.0, "B", 1.0);
        assert_eq!(notified(&db.take_mail("A"), "TEMP").len(), 1);

        write(&mut db, "TEMP", 3.0, "B", 2.5);
        let later = notified(&db.take_mail("A"), "TEMP");
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].value, Value::Double(3.0));
    }

    #[test]
    fn test_zero_period_every_write() {
        let mut db = db();
        db.register("TEMP", "A", 0.0, 0.0).unwrap();
        for i in 0..5 {
            write(&mut db, "TEMP", i as f64, "B", 0.0);
        }
        assert_eq!(notified(&db.take_mail("A"), "TEMP").len(), 5);
    }

    #[test]
    fn test_register_existing_value_delivers_immediately() {
        let mut db = db();
        write(&mut db, "TEMP", 21.5, "B", 0.0);
        db.register("TEMP", "A", 0.0, 1.0).unwrap();

        let temps = notified(&db.take_mail("A"), "TEMP");
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].value, Value::Double(21.5));
    }

    #[test]
    fn test_register_does_not_move_other_baselines() {
        let mut db = db();
        db.register("TEMP", "A", 2.0, 0.0).unwrap();
        write(&mut db, "TEMP", 1.0, "B", 0.0);
        db.take_mail("A");

        db.register("TEMP", "C", 2.0, 1.0).unwrap();
        let a = db.get("TEMP").unwrap().subscribers.get("A").unwrap();
        assert_eq!(a.last_delivery, 0.0);
        let c = db.get("TEMP").unwrap().subscribers.get("C").unwrap();
        assert_eq!(c.last_delivery, 1.0);
    }

    #[test]
    fn test_register_unknown_creates_untyped() {
        let mut db = db();
        db.register("FUTURE", "A", 0.0, 0.0).unwrap();
        let var = db.get("FUTURE").unwrap();
        assert_eq!(var.data_type, DataType::NotSet);
        assert!(db.take_mail("A").is_empty());
    }

    #[test]
    fn test_register_empty_client_rejected() {
        let mut db = db();
        assert_eq!(
            db.register("TEMP", "", 0.0, 0.0),
            Err(ApplyError::EmptyClient("register"))
        );
    }

    #[test]
    fn test_unregister() {
        let mut db = db();
        db.register("FLAG", "D", 0.0, 0.0).unwrap();
        db.unregister("FLAG", "D");
        write(&mut db, "FLAG", 1.0, "B", 0.0);
        assert!(notified(&db.take_mail("D"), "FLAG").is_empty());

        // Unknown variable is a no-op
        db.unregister("NOPE", "D");
        assert!(db.get("NOPE").is_none());
    }

    #[test]
    fn test_disconnect_cleanup() {
        let mut db = db();
        db.connect("A", 0.0);
        db.register("TEMP", "A", 0.0, 0.0).unwrap();
        db.register("DEPTH", "A", 0.5, 0.0).unwrap();
        write(&mut db, "TEMP", 1.0, "B", 0.0);

        db.disconnect("A", 1.0);
        assert!(db.subscriptions_of("A").is_empty());
        assert!(!db.has_outbox("A"));

        write(&mut db, "TEMP", 2.0, "B", 2.0);
        assert!(!db.has_outbox("A"));
    }

    #[test]
    fn test_db_clear_idempotent() {
        let mut db = db();
        db.register("TEMP", "A", 0.0, 0.0).unwrap();
        write(&mut db, "TEMP", 1.0, "B", 0.0);
        write(&mut db, "NAME", "x", "B", 0.0);

        let mut replies = Vec::new();
        db.server_request(REQUEST_DB_CLEAR, &[], 5.0, &mut replies)
            .unwrap();
        let names_once: Vec<String> = db.vars.keys().cloned().collect();
        db.server_request(REQUEST_DB_CLEAR, &[], 6.0, &mut replies)
            .unwrap();
        let names_twice: Vec<String> = db.vars.keys().cloned().collect();

        assert_eq!(names_once, names_twice);
        for var in db.vars.values() {
            assert_eq!(var.data_type, DataType::NotSet);
            assert!(var.value.is_none());
            assert!(var.writers.is_empty());
            assert_eq!(var.write_count, 0);
        }
        assert!(db.get("TEMP").unwrap().is_subscribed("A"));
        assert!(!db.has_mail("A"));
        assert_eq!(db.uptime(6.0), 0.0);

        // Type can be re-established after a clear
        write(&mut db, "NAME", 1.0, "B", 7.0);
        assert_eq!(db.get("NAME").unwrap().data_type, DataType::Double);
    }

    #[test]
    fn test_server_request_all() {
        let mut db = db();
        write(&mut db, "A", 1.0, "X", 0.0);
        write(&mut db, "B", "two", "X", 0.0);
        db.register("UNWRITTEN", "Y", 0.0, 0.0).unwrap();

        let mut replies = Vec::new();
        db.server_request(REQUEST_ALL, &[], 1.0, &mut replies)
            .unwrap();
        let keys: Vec<&str> = replies
            .iter()
            .filter_map(Message::as_notification)
            .map(|n| n.key.as_str())
            .collect();
        assert_eq!(keys, vec!["A", "B"]);
    }

    #[test]
    fn test_proc_summary() {
        let mut db = db();
        db.register("TEMP", "A", 0.0, 0.0).unwrap();
        write(&mut db, "SPEED", 1.0, "A", 0.0);

        let clients = vec!["A".to_string()];
        let mut replies = Vec::new();
        db.server_request(REQUEST_PROC_SUMMARY, &clients, 1.0, &mut replies)
            .unwrap();

        assert_eq!(replies.len(), 1);
        let n = replies[0].as_notification().unwrap();
        assert_eq!(n.key, REQUEST_PROC_SUMMARY);
        assert_eq!(n.source, "VARDB_#1");
        assert_eq!(
            n.value,
            Value::from("A:SUBSCRIBED=TEMP,PUBLISHED=SPEED")
        );
    }

    #[test]
    fn test_var_summary_and_unknown_request() {
        let mut db = db();
        write(&mut db, "B", 1.0, "X", 0.0);
        write(&mut db, "A", 1.0, "X", 0.0);

        let mut replies = Vec::new();
        db.server_request(REQUEST_VAR_SUMMARY, &[], 1.0, &mut replies)
            .unwrap();
        assert_eq!(replies[0].as_notification().unwrap().value, Value::from("A,B"));

        assert!(matches!(
            db.server_request("BOGUS", &[], 1.0, &mut replies),
            Err(ApplyError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_wildcard_existing_and_future() {
        let mut db = db();
        write(&mut db, "NAV_X", 1.0, "pNav", 0.0);
        write(&mut db, "DEPTH", 1.0, "pNav", 0.0);

        db.wildcard_register("W", WildcardFilter::new("NAV_*", "", 0.0), 0.0)
            .unwrap();
        assert_eq!(notified(&db.take_mail("W"), "NAV_X").len(), 1);

        write(&mut db, "NAV_Y", 2.0, "pNav", 1.0);
        write(&mut db, "SPEED", 2.0, "pNav", 1.0);
        let mail = db.take_mail("W");
        assert_eq!(notified(&mail, "NAV_Y").len(), 1);
        assert!(notified(&mail, "SPEED").is_empty());

        db.wildcard_unregister("W", "NAV_*", "");
        assert!(db.subscriptions_of("W").is_empty());
        write(&mut db, "NAV_Z", 3.0, "pNav", 2.0);
        assert!(db.take_mail("W").is_empty());
    }

    #[test]
    fn test_wildcard_app_pattern() {
        let mut db = db();
        db.wildcard_register("W", WildcardFilter::new("*", "pHelm", 0.0), 0.0)
            .unwrap();
        write(&mut db, "DESIRED_SPEED", 1.0, "pHelm", 0.0);
        write(&mut db, "NAV_SPEED", 1.0, "pNav", 0.0);

        let subs = db.subscriptions_of("W");
        assert_eq!(subs, vec!["DESIRED_SPEED"]);
    }

    #[test]
    fn test_self_variables() {
        let mut db = db();
        db.register(VAR_DB_CLIENTS, "A", 0.0, 0.0).unwrap();
        db.register(VAR_DB_UPTIME, "A", 0.0, 0.0).unwrap();

        let clients = vec!["A".to_string(), "B".to_string()];
        db.refresh_self_variables(10.0, &clients);

        let mail = db.take_mail("A");
        let listed = notified(&mail, VAR_DB_CLIENTS);
        assert_eq!(listed[0].value, Value::from("A,B"));
        assert_eq!(listed[0].source, "VARDB_#1");
        assert_eq!(
            notified(&mail, VAR_DB_UPTIME)[0].value,
            Value::Double(10.0)
        );

        // Not due again yet
        db.refresh_self_variables(10.5, &clients);
        assert!(db.take_mail("A").is_empty());

        // Time refreshes at 1 Hz, client list at 0.5 Hz
        db.refresh_self_variables(11.0, &clients);
        let mail = db.take_mail("A");
        assert_eq!(notified(&mail, VAR_DB_UPTIME).len(), 1);
        assert!(notified(&mail, VAR_DB_CLIENTS).is_empty());

        let rw = db.get(VAR_DB_RWSUMMARY).unwrap();
        assert_eq!(
            rw.value,
            Some(Value::from("A=DB_CLIENTS:DB_UPTIME&,B=&"))
        );
    }

    #[test]
    fn test_connect_event() {
        let mut db = db();
        db.register(VAR_DB_EVENT, "A", 0.0, 0.0).unwrap();
        db.connect("B", 1.0);
        db.disconnect("B", 2.0);

        let events: Vec<Value> = notified(&db.take_mail("A"), VAR_DB_EVENT)
            .into_iter()
            .map(|n| n.value)
            .collect();
        assert_eq!(
            events,
            vec![Value::from("connected=B"), Value::from("disconnected=B")]
        );
    }

    #[test]
    fn test_apply_fills_missing_source() {
        let mut db = db();
        let mut replies = Vec::new();
        db.apply(
            Message::Notify(Notification::new("TEMP", 1.0, 0.0)),
            "B",
            &[],
            0.0,
            &mut replies,
        )
        .unwrap();
        assert_eq!(db.get("TEMP").unwrap().writer, "B");
    }

    #[test]
    fn test_register_for_other_client_rejected() {
        let mut db = db();
        let mut replies = Vec::new();
        db.connect("A", 0.0);

        let err = db
            .apply(
                Message::Register {
                    key: "T".into(),
                    client: "GHOST".into(),
                    period: 0.0,
                },
                "A",
                &[],
                0.0,
                &mut replies,
            )
            .unwrap_err();
        assert!(matches!(err, ApplyError::ForeignClient { .. }));

        let err = db
            .apply(
                Message::WildcardRegister {
                    client: "GHOST".into(),
                    var_pattern: "*".into(),
                    app_pattern: String::new(),
                    period: 0.0,
                },
                "A",
                &[],
                0.0,
                &mut replies,
            )
            .unwrap_err();
        assert!(matches!(err, ApplyError::ForeignClient { .. }));

        db.disconnect("A", 1.0);
        write(&mut db, "T", 1.0, "B", 2.0);
        assert!(!db.has_outbox("GHOST"));
        assert!(db.subscriptions_of("GHOST").is_empty());
    }

    #[test]
    fn test_register_own_name_through_apply() {
        let mut db = db();
        let mut replies = Vec::new();
        db.apply(
            Message::Register {
                key: "T".into(),
                client: "A".into(),
                period: 0.0,
            },
            "A",
            &[],
            0.0,
            &mut replies,
        )
        .unwrap();
        assert!(db.get("T").unwrap().is_subscribed("A"));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(40);
        let shown = preview(Some(&Value::String(long)));
        assert_eq!(shown.chars().count(), 25);
        assert!(shown.ends_with("..."));
    }
}
