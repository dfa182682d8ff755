//! Job progress
//!
//! Each pipeline owns a set of atomic counters. The job controller reads them
//! on a timer and publishes a [`ProgressSnapshot`]; pipelines never block on
//! progress reporting.

use crate::types::Channel;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of a decode job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    /// True once the job can no longer change state
    pub fn is_terminal(self) -> bool {
        self != JobState::Running
    }
}

/// Counters updated by one pipeline while it runs
#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// Input lines consumed, including lines for other channels
    pub lines_scanned: AtomicU64,
    /// Frames that belong to this pipeline's channel
    pub rows_read: AtomicU64,
    pub rows_decoded: AtomicU64,
    pub rows_written: AtomicU64,
    pub warnings: AtomicU64,
}

impl PipelineCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Point-in-time copy for a progress snapshot
    pub fn snapshot(&self, channel: Channel, finished: bool) -> ChannelProgress {
        ChannelProgress {
            channel,
            lines_scanned: Self::get(&self.lines_scanned),
            rows_read: Self::get(&self.rows_read),
            rows_decoded: Self::get(&self.rows_decoded),
            rows_written: Self::get(&self.rows_written),
            warnings: Self::get(&self.warnings),
            finished,
        }
    }
}

/// Progress of one bus pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelProgress {
    pub channel: Channel,
    pub lines_scanned: u64,
    pub rows_read: u64,
    pub rows_decoded: u64,
    pub rows_written: u64,
    pub warnings: u64,
    pub finished: bool,
}

/// Progress of a whole job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub state: JobState,
    /// Overall completion in `0.0..=1.0`; only reaches 1.0 once the job is done
    pub fraction: f64,
    /// Estimated number of data lines in the input
    pub estimated_rows: u64,
    pub channels: Vec<ChannelProgress>,
}

impl ProgressSnapshot {
    /// Build a snapshot from per-pipeline progress
    ///
    /// The job is as far along as its slowest pipeline. While running the
    /// fraction is held below 1.0 because the row estimate is approximate.
    pub fn new(state: JobState, estimated_rows: u64, channels: Vec<ChannelProgress>) -> Self {
        let fraction = match state {
            JobState::Completed => 1.0,
            _ => {
                let slowest = channels
                    .iter()
                    .map(|c| {
                        if c.finished {
                            1.0
                        } else if estimated_rows == 0 {
                            0.0
                        } else {
                            c.lines_scanned as f64 / estimated_rows as f64
                        }
                    })
                    .fold(f64::INFINITY, f64::min);
                if slowest.is_finite() {
                    slowest.clamp(0.0, 0.999)
                } else {
                    0.0
                }
            }
        };

        Self {
            state,
            fraction,
            estimated_rows,
            channels,
        }
    }

    /// Total rows written across all channels
    pub fn rows_written(&self) -> u64 {
        self.channels.iter().map(|c| c.rows_written).sum()
    }
}
