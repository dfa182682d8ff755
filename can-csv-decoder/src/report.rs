//! Job results
//!
//! Warnings are kept apart from the terminating status: a job can complete
//! with warnings, and a failed job still reports the warnings collected
//! before it stopped.

use crate::types::{Channel, DecoderError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// A non-fatal problem recorded during a job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobWarning {
    /// An input row could not be parsed and was skipped
    MalformedRow { line: u64, reason: String },
    /// A signal did not fit its frame's payload and was omitted
    TruncatedSignal {
        channel: Channel,
        message_id: u32,
        line: u64,
        signal: String,
        required: usize,
        available: usize,
    },
    /// An output stream passed the row cap with roll-over disabled
    RowCapExceeded { path: PathBuf, cap: u64 },
    /// A pipeline stopped with a fatal error while the job carried on
    PipelineFailed { channel: Channel, error: String },
}

impl fmt::Display for JobWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobWarning::MalformedRow { line, reason } => {
                write!(f, "line {}: skipped malformed row ({})", line, reason)
            }
            JobWarning::TruncatedSignal {
                channel,
                message_id,
                line,
                signal,
                required,
                available,
            } => write!(
                f,
                "line {}: {} 0x{:X} signal '{}' needs {} bytes, frame has {}",
                line, channel, message_id, signal, required, available
            ),
            JobWarning::RowCapExceeded { path, cap } => {
                write!(f, "{:?} holds more than {} data rows", path, cap)
            }
            JobWarning::PipelineFailed { channel, error } => {
                write!(f, "{} pipeline failed: {}", channel, error)
            }
        }
    }
}

/// Bounded warning list; warnings past the limit are only counted
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarningLog {
    limit: usize,
    warnings: Vec<JobWarning>,
    suppressed: u64,
}

impl WarningLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            warnings: Vec::new(),
            suppressed: 0,
        }
    }

    pub fn push(&mut self, warning: JobWarning) {
        if self.warnings.len() < self.limit {
            log::warn!("{}", warning);
            self.warnings.push(warning);
        } else {
            self.suppressed += 1;
        }
    }

    /// Move another log's entries in, respecting this log's limit
    pub fn absorb(&mut self, other: WarningLog) {
        self.suppressed += other.suppressed;
        for warning in other.warnings {
            if self.warnings.len() < self.limit {
                self.warnings.push(warning);
            } else {
                self.suppressed += 1;
            }
        }
    }

    pub fn warnings(&self) -> &[JobWarning] {
        &self.warnings
    }

    /// Warnings dropped because the limit was reached
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Retained plus suppressed
    pub fn total(&self) -> u64 {
        self.warnings.len() as u64 + self.suppressed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Per-channel totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub channel: Channel,
    pub rows_read: u64,
    pub rows_decoded: u64,
    pub rows_written: u64,
    pub warnings: u64,
    /// Fatal error, if the pipeline stopped early
    pub error: Option<String>,
}

/// Summary of a finished (or cancelled) job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    /// Output files in creation order
    pub outputs: Vec<PathBuf>,
    pub channels: Vec<ChannelSummary>,
    pub warnings: Vec<JobWarning>,
    pub warnings_suppressed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn rows_written(&self) -> u64 {
        self.channels.iter().map(|c| c.rows_written).sum()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Terminal status of a job
#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobReport),
    /// Stopped on request; `outputs` lists the partial files
    Cancelled(JobReport),
    Failed {
        error: DecoderError,
        warnings: Vec<JobWarning>,
    },
}

impl JobOutcome {
    pub fn report(&self) -> Option<&JobReport> {
        match self {
            JobOutcome::Completed(report) | JobOutcome::Cancelled(report) => Some(report),
            JobOutcome::Failed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}
