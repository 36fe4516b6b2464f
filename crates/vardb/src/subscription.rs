// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriptions and delivery throttling.
//!
//! A [`Subscription`] records one client's interest in one variable and the
//! minimum interval between deliveries. A [`WildcardFilter`] is a standing
//! interest in every variable whose name and writer match glob patterns.

use serde::{Deserialize, Serialize};

/// One client's subscription to one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Subscribing client.
    pub client: String,
    /// Minimum seconds between deliveries; 0 means every write.
    pub period: f64,
    /// Time of the last delivery to this client.
    pub last_delivery: f64,
}

impl Subscription {
    /// New subscription that has never delivered.
    pub fn new(client: impl Into<String>, period: f64) -> Self {
        Self {
            client: client.into(),
            period: period.max(0.0),
            last_delivery: f64::NEG_INFINITY,
        }
    }

    /// Whether a write at `now` should be delivered.
    pub fn expired(&self, now: f64) -> bool {
        if self.period <= 0.0 {
            return true;
        }
        now - self.last_delivery >= self.period
    }

    /// Record a delivery at `now`.
    pub fn mark_delivered(&mut self, now: f64) {
        self.last_delivery = now;
    }
}

/// Standing subscription to every variable matching a pair of glob patterns.
///
/// `*` matches any run of characters, `?` exactly one. An empty pattern
/// matches everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WildcardFilter {
    /// Pattern applied to variable names.
    pub var_pattern: String,
    /// Pattern applied to the writing client's name.
    pub app_pattern: String,
    /// Delivery period for subscriptions created by this filter.
    pub period: f64,
}

impl WildcardFilter {
    pub fn new(var_pattern: impl Into<String>, app_pattern: impl Into<String>, period: f64) -> Self {
        Self {
            var_pattern: var_pattern.into(),
            app_pattern: app_pattern.into(),
            period,
        }
    }

    /// Check a variable name and its writer against this filter.
    ///
    /// An unwritten variable has no writer yet, so only the name is checked.
    pub fn matches(&self, key: &str, writer: Option<&str>) -> bool {
        if !pattern_matches(&self.var_pattern, key) {
            return false;
        }
        match writer {
            Some(w) => pattern_matches(&self.app_pattern, w),
            None => true,
        }
    }

    /// Same patterns, ignoring period.
    pub fn same_patterns(&self, var_pattern: &str, app_pattern: &str) -> bool {
        self.var_pattern == var_pattern && self.app_pattern == app_pattern
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    glob_match(pattern, text)
}

/// Match `text` against a glob pattern with `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();
    glob_match_at(&pattern_chars, &text_chars, 0, 0)
}

fn glob_match_at(pattern: &[char], text: &[char], pi: usize, ti: usize) -> bool {
    if pi == pattern.len() {
        return ti == text.len();
    }

    match pattern[pi] {
        '*' => (ti..=text.len()).any(|i| glob_match_at(pattern, text, pi + 1, i)),
        '?' => ti < text.len() && glob_match_at(pattern, text, pi + 1, ti + 1),
        c => ti < text.len() && text[ti] == c && glob_match_at(pattern, text, pi + 1, ti + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_period_always_expired() {
        let mut sub = Subscription::new("A", 0.0);
        assert!(sub.expired(0.0));
        sub.mark_delivered(10.0);
        assert!(sub.expired(10.0));
    }

    #[test]
    fn test_throttle_window() {
        let mut sub = Subscription::new("A", 1.0);
        assert!(sub.expired(0.0));
        sub.mark_delivered(0.0);
        assert!(!sub.expired(0.1));
        assert!(!sub.expired(0.9));
        assert!(sub.expired(1.0));
    }

    #[test]
    fn test_negative_period_clamped() {
        let sub = Subscription::new("A", -3.0);
        assert_eq!(sub.period, 0.0);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("NAV_*", "NAV_X"));
        assert!(glob_match("NAV_?", "NAV_X"));
        assert!(!glob_match("NAV_?", "NAV_XY"));
        assert!(glob_match("*", ""));
        assert!(glob_match("*_SPEED", "DESIRED_SPEED"));
        assert!(!glob_match("NAV", "NAV_X"));
    }

    #[test]
    fn test_wildcard_filter() {
        let filter = WildcardFilter::new("NAV_*", "pNav*", 0.0);
        assert!(filter.matches("NAV_X", Some("pNavigator")));
        assert!(!filter.matches("NAV_X", Some("pHelm")));
        assert!(filter.matches("NAV_X", None));
        assert!(!filter.matches("DEPTH", None));

        let any = WildcardFilter::new("", "", 0.0);
        assert!(any.matches("ANYTHING", Some("anyone")));
    }
}
