//! Background garbage collector.
//!
//! One task owns the schedule. It waits on a single `select!` over the
//! command queue and the interval timer; commands are polled first, so a
//! `Stop` that arrives together with a tick wins and no further sweep
//! starts. Queued `Run` requests are drained before sweeping, and a `Stop`
//! found among them cancels them too. A sweep that is already running is
//! never interrupted.

use crate::operations::{SweepOperation, SweepOperationRequest, SweepReport};
use crate::storage::BlobStore;
use crate::{ImageCatalog, Result, StashError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_GC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_GC_LIMIT: usize = 100;
pub const RECENT_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_secs: u64,
    /// Maximum expired uuids handled per sweep.
    pub limit: usize,
    /// Recent entries kept by the trim pass.
    pub recent_limit: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_GC_INTERVAL_SECS,
            limit: DEFAULT_GC_LIMIT,
            recent_limit: RECENT_LIMIT,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStatus {
    pub state: CollectorState,
    pub completed_sweeps: u64,
}

enum GcCommand {
    Run {
        reply: oneshot::Sender<Result<SweepReport>>,
    },
    Stop,
}

/// Control side of a running collector.
#[derive(Clone)]
pub struct GcHandle {
    commands: mpsc::UnboundedSender<GcCommand>,
    status: watch::Receiver<CollectorStatus>,
}

impl GcHandle {
    /// Sweep now, outside the schedule. The timer is not reset.
    pub async fn run_now(&self) -> Result<SweepReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(GcCommand::Run { reply })
            .map_err(|_| StashError::Internal("garbage collector has stopped".to_string()))?;
        response
            .await
            .map_err(|_| StashError::Internal("garbage collector has stopped".to_string()))?
    }

    /// Ask the collector to stop and wait until it has.
    ///
    /// A sweep in progress finishes first. Calling this more than once is
    /// harmless.
    pub async fn stop(&self) {
        let _ = self.commands.send(GcCommand::Stop);
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|status| status.state == CollectorState::Terminated)
            .await;
    }

    pub fn state(&self) -> CollectorState {
        self.status.borrow().state
    }

    pub fn completed_sweeps(&self) -> u64 {
        self.status.borrow().completed_sweeps
    }

    /// Wait until at least `count` sweeps have completed, successful or not.
    pub async fn wait_for_sweeps(&self, count: u64) -> Result<()> {
        let mut status = self.status.clone();
        let status = status
            .wait_for(|status| {
                status.completed_sweeps >= count || status.state == CollectorState::Terminated
            })
            .await
            .map_err(|_| StashError::Internal("garbage collector has stopped".to_string()))?;
        if status.completed_sweeps >= count {
            Ok(())
        } else {
            Err(StashError::Internal(
                "garbage collector stopped before the requested sweeps".to_string(),
            ))
        }
    }
}

pub struct GarbageCollector {
    operation: SweepOperation,
    config: GcConfig,
    commands: mpsc::UnboundedReceiver<GcCommand>,
    status: watch::Sender<CollectorStatus>,
}

impl GarbageCollector {
    /// Start the collector on the current tokio runtime.
    pub fn spawn(
        catalog: Arc<ImageCatalog>,
        blob_store: Arc<dyn BlobStore>,
        config: GcConfig,
    ) -> GcHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CollectorStatus {
            state: CollectorState::Idle,
            completed_sweeps: 0,
        });

        let collector = Self {
            operation: SweepOperation::new(catalog, blob_store),
            config,
            commands: command_rx,
            status: status_tx,
        };
        tokio::spawn(collector.run());

        GcHandle {
            commands: command_tx,
            status: status_rx,
        }
    }

    async fn run(mut self) {
        let period = self.config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Garbage collector started (interval={}s, limit={}, recent_limit={})",
            period.as_secs(),
            self.config.limit,
            self.config.recent_limit
        );

        'collector: loop {
            let reply = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(GcCommand::Run { reply }) => Some(reply),
                    Some(GcCommand::Stop) | None => break 'collector,
                },
                _ = ticker.tick() => None,
            };

            let mut pending: VecDeque<_> = reply.into_iter().collect();
            if self.drain_commands(&mut pending) {
                break 'collector;
            }

            if pending.is_empty() {
                let _ = self.sweep_once().await;
                continue;
            }

            while let Some(reply) = pending.pop_front() {
                let result = self.sweep_once().await;
                let _ = reply.send(result);
                if self.drain_commands(&mut pending) {
                    break 'collector;
                }
            }
        }

        self.status
            .send_modify(|status| status.state = CollectorState::Terminated);
        tracing::info!("Garbage collector stopped");
    }

    /// Move queued `Run` requests into `pending`. Returns true when a `Stop`
    /// is queued; the pending replies are then dropped unanswered so their
    /// callers see the collector as stopped.
    fn drain_commands(
        &mut self,
        pending: &mut VecDeque<oneshot::Sender<Result<SweepReport>>>,
    ) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(GcCommand::Run { reply }) => pending.push_back(reply),
                Ok(GcCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    if !pending.is_empty() {
                        tracing::info!("Dropping {} queued sweep(s) on stop", pending.len());
                    }
                    pending.clear();
                    return true;
                }
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    async fn sweep_once(&self) -> Result<SweepReport> {
        self.status
            .send_modify(|status| status.state = CollectorState::Running);

        let result = self
            .operation
            .run(SweepOperationRequest {
                now: Utc::now(),
                gc_limit: self.config.limit,
                recent_limit: self.config.recent_limit,
            })
            .await;

        match &result {
            Ok(report) => tracing::info!(
                "GC sweep done: trimmed={}, expired={}, repaired={}, blobs_deleted={}, blob_failures={}",
                report.recent_trimmed,
                report.expired_deleted,
                report.dangling_repaired,
                report.blobs_deleted,
                report.blob_failures
            ),
            Err(error) => tracing::error!("GC sweep failed: {}", error),
        }

        self.status.send_modify(|status| {
            status.state = CollectorState::Idle;
            status.completed_sweeps += 1;
        });
        result
    }
}
