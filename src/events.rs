//! Event stream and observer interface consumed by the logger, UI, and
//! metrics exporter (component G / §6 Observer interface).

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    PortQueued {
        port_dir: String,
    },
    PortPhaseStarted {
        port_dir: String,
        phase: String,
    },
    PortPhaseFinished {
        port_dir: String,
        phase: String,
        exit_code: i32,
    },
    PortSucceeded {
        port_dir: String,
    },
    PortFailed {
        port_dir: String,
        phase: String,
        reason: String,
    },
    PortSkipped {
        port_dir: String,
        reason: String,
    },
    RunStarted {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        stats: StatsSnapshot,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub skipped_pre: usize,
    pub ignored: usize,
    pub duration_ms: u64,
}

pub trait Observer: Send + Sync {
    fn on_event(&self, event: Event);
    fn on_stats(&self, stats: StatsSnapshot);
}

/// Discards everything. Used in tests and `--quiet` runs.
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: Event) {}
    fn on_stats(&self, _stats: StatsSnapshot) {}
}

/// Structured-logging observer built on `tracing`; see DESIGN.md for the
/// rationale behind adding a logging dependency.
pub struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn on_event(&self, event: Event) {
        match &event {
            Event::PortFailed {
                port_dir,
                phase,
                reason,
            } => {
                tracing::error!(port = %port_dir, %phase, %reason, "port failed");
            }
            Event::PortSkipped { port_dir, reason } => {
                tracing::info!(port = %port_dir, %reason, "port skipped");
            }
            Event::PortSucceeded { port_dir } => {
                tracing::info!(port = %port_dir, "port succeeded");
            }
            Event::PortPhaseStarted { port_dir, phase } => {
                tracing::debug!(port = %port_dir, %phase, "phase started");
            }
            Event::PortPhaseFinished {
                port_dir,
                phase,
                exit_code,
            } => {
                tracing::debug!(port = %port_dir, %phase, %exit_code, "phase finished");
            }
            Event::PortQueued { port_dir } => {
                tracing::debug!(port = %port_dir, "port queued");
            }
            Event::RunStarted { run_id } => {
                tracing::info!(%run_id, "run started");
            }
            Event::RunFinished { run_id, stats } => {
                tracing::info!(
                    %run_id,
                    total = stats.total,
                    success = stats.success,
                    failed = stats.failed,
                    skipped = stats.skipped,
                    skipped_pre = stats.skipped_pre,
                    ignored = stats.ignored,
                    "run finished"
                );
            }
        }
    }

    fn on_stats(&self, stats: StatsSnapshot) {
        tracing::debug!(
            total = stats.total,
            success = stats.success,
            failed = stats.failed,
            "stats snapshot"
        );
    }
}

/// Forwards events over a bounded channel. The seam a TUI or metrics
/// exporter attaches to without this crate depending on either.
pub struct ChannelObserver {
    events: Mutex<Sender<Event>>,
    stats: Mutex<Sender<StatsSnapshot>>,
}

impl ChannelObserver {
    pub fn new(events: Sender<Event>, stats: Sender<StatsSnapshot>) -> Self {
        Self {
            events: Mutex::new(events),
            stats: Mutex::new(stats),
        }
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, event: Event) {
        let _ = self.events.lock().unwrap().try_send(event);
    }

    fn on_stats(&self, stats: StatsSnapshot) {
        let _ = self.stats.lock().unwrap().try_send(stats);
    }
}
