// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session reaper.
//!
//! Retired sessions are handed to a single background task that waits for
//! their workers to finish (bounded by a grace period) and aborts stragglers,
//! so teardown never stalls the accept loop.

use super::session::LiveSession;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Reaper counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Sessions fully torn down.
    pub reaped: u64,
    /// Worker tasks aborted after the grace period.
    pub aborted: u64,
}

enum ReaperCommand {
    Retire(LiveSession),
    Drain(oneshot::Sender<ReaperStats>),
}

/// Handle used by the connection manager.
#[derive(Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<ReaperCommand>,
}

impl ReaperHandle {
    /// Queue a session for destruction.
    pub fn retire(&self, mut session: LiveSession) {
        session.begin_close();
        // Reaper gone: the dropped session's tasks already saw the stop flag.
        let _ = self.tx.send(ReaperCommand::Retire(session));
    }

    /// Reap everything queued so far, then stop the reaper.
    pub async fn shutdown(&self) -> ReaperStats {
        let (done, rx) = oneshot::channel();
        if self.tx.send(ReaperCommand::Drain(done)).is_err() {
            return ReaperStats::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// The reaper task.
pub struct Reaper {
    rx: mpsc::UnboundedReceiver<ReaperCommand>,
    grace: Duration,
    stats: ReaperStats,
}

impl Reaper {
    /// Spawn the reaper on the current runtime.
    pub fn spawn(grace: Duration) -> (ReaperHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reaper = Self {
            rx,
            grace,
            stats: ReaperStats::default(),
        };
        (ReaperHandle { tx }, tokio::spawn(reaper.run()))
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ReaperCommand::Retire(mut session) => {
                    let aborted = session.reap(self.grace).await;
                    self.stats.reaped += 1;
                    self.stats.aborted += aborted as u64;
                    debug!(
                        "Reaped session {} '{}' ({} tasks aborted)",
                        session.id, session.client, aborted
                    );
                }
                ReaperCommand::Drain(done) => {
                    let _ = done.send(self.stats);
                    break;
                }
            }
        }
        debug!(
            "Reaper stopped: {} sessions reaped, {} tasks aborted",
            self.stats.reaped, self.stats.aborted
        );
    }
}
