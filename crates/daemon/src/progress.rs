//! Progress aggregation across job phases
//!
//! A job moves through two weighted phases. The tracker folds per-phase
//! percentages into one overall figure and an ETA; events derived from it are
//! pushed on a broadcast channel that HTTP clients and tests subscribe to.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Top-level stage of a render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extraction,
    Encoding,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extraction => "extraction",
            Phase::Encoding => "encoding",
        }
    }

    fn index(&self) -> usize {
        match self {
            Phase::Extraction => 0,
            Phase::Encoding => 1,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct PhaseState {
    phase: Phase,
    weight: f64,
    progress: f64,
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub phase_progress: f64,
    pub overall: f64,
    pub elapsed_secs: f64,
    pub time_remaining_secs: Option<f64>,
}

/// Weighted aggregation of phase progress.
///
/// Phase progress never regresses and starting a later phase pins every earlier
/// phase at 100, so inactive phases always read 0 or 100.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    phases: [PhaseState; 2],
    current: Phase,
    overall: f64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(extraction_weight: f64, encoding_weight: f64) -> Self {
        Self {
            phases: [
                PhaseState {
                    phase: Phase::Extraction,
                    weight: extraction_weight,
                    progress: 0.0,
                },
                PhaseState {
                    phase: Phase::Encoding,
                    weight: encoding_weight,
                    progress: 0.0,
                },
            ],
            current: Phase::Extraction,
            overall: 0.0,
            started: Instant::now(),
        }
    }

    /// Record progress (0-100) for a phase and return the resulting snapshot.
    pub fn update(&mut self, phase: Phase, percent: f64) -> ProgressSnapshot {
        let idx = phase.index();
        for earlier in self.phases.iter_mut().take(idx) {
            earlier.progress = 100.0;
        }
        if idx >= self.current.index() {
            self.current = phase;
        }

        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let state = &mut self.phases[idx];
        if percent > state.progress {
            state.progress = percent;
        }

        let weighted: f64 = if self.phases.iter().all(|p| p.progress >= 100.0) {
            100.0
        } else {
            self.phases.iter().map(|p| p.progress * p.weight).sum()
        };
        self.overall = self.overall.max(weighted.min(100.0));

        self.snapshot()
    }

    /// Mark a phase finished.
    pub fn complete_phase(&mut self, phase: Phase) -> ProgressSnapshot {
        self.update(phase, 100.0)
    }

    pub fn overall(&self) -> f64 {
        self.overall
    }

    pub fn current_phase(&self) -> Phase {
        self.current
    }

    pub fn phase_progress(&self, phase: Phase) -> f64 {
        self.phases[phase.index()].progress
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.elapsed().as_secs_f64();
        ProgressSnapshot {
            phase: self.current,
            phase_progress: self.phase_progress(self.current),
            overall: self.overall,
            elapsed_secs: elapsed,
            time_remaining_secs: estimate_remaining(elapsed, self.overall),
        }
    }

    /// Iterate the configured phases and weights.
    pub fn weights(&self) -> impl Iterator<Item = (Phase, f64)> + '_ {
        self.phases.iter().map(|p| (p.phase, p.weight))
    }
}

/// ETA = elapsed * (100 / overall) - elapsed. Undefined while nothing has progressed.
pub fn estimate_remaining(elapsed_secs: f64, overall: f64) -> Option<f64> {
    if overall <= 0.0 || !overall.is_finite() {
        return None;
    }
    Some((elapsed_secs * (100.0 / overall) - elapsed_secs).max(0.0))
}

/// Map a fraction of a sub-range onto phase percent, e.g. pass 2 of 2 covers 50..100.
pub fn scale_into(range_start: f64, range_end: f64, fraction: f64) -> f64 {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    range_start + (range_end - range_start) * fraction
}

/// What an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventKind::Progress)
    }
}

/// Message pushed to subscribers for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub progress: f64,
    pub phase: String,
    pub time_remaining_secs: Option<f64>,
    pub memory_usage_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

pub type EventSender = broadcast::Sender<ProgressEvent>;
pub type EventReceiver = broadcast::Receiver<ProgressEvent>;

/// Bounded event channel. Slow subscribers observe `Lagged` rather than
/// blocking the pipeline.
pub fn event_channel(capacity: usize) -> EventSender {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    tx
}

/// Memory currently in use on the host, in bytes.
pub fn memory_usage_bytes() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.used_memory()
}
