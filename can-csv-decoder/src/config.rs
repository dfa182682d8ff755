//! Job configuration types
//!
//! A `JobConfig` is an immutable snapshot taken when a decode job starts.
//! Re-running with different options means building a new configuration.

use crate::types::Channel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Row limit of a modern `.xlsx` worksheet (header included)
pub const EXCEL_XLSX_MAX_ROWS: u64 = 1_048_576;

/// Row limit of a legacy `.xls` worksheet (header included)
pub const EXCEL_XLS_MAX_ROWS: u64 = 65_536;

/// Configuration for one decode job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Input capture (CSV of raw frames)
    pub input: PathBuf,

    /// Output base path; channel and part suffixes are derived from it
    pub output: PathBuf,

    /// Channel / message-id allow-lists
    #[serde(default)]
    pub filter: ChannelFilter,

    /// How bitfield signals are expanded into per-bit columns
    #[serde(default)]
    pub bit_expansion: BitExpansion,

    /// Maximum data rows per output file
    #[serde(default)]
    pub row_cap: RowCapMode,

    /// Roll over to a new `_partNNN` file when the row cap is reached
    #[serde(default = "default_true")]
    pub split_on_cap: bool,

    /// Write CAN0 and CAN1 to separate files
    #[serde(default = "default_true")]
    pub split_channels: bool,

    /// What to do with rows that cannot be parsed
    #[serde(default)]
    pub malformed_rows: MalformedPolicy,

    /// A fatal error in one pipeline fails the whole job
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Decoded rows buffered per output stream before a flush
    #[serde(default = "default_flush_rows")]
    pub flush_rows: usize,

    /// Progress publishing cadence in milliseconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Warnings retained per pipeline; the rest are only counted
    #[serde(default = "default_max_warnings")]
    pub max_warnings: usize,
}

fn default_true() -> bool {
    true
}

fn default_flush_rows() -> usize {
    10_000
}

fn default_progress_interval() -> u64 {
    250
}

fn default_max_warnings() -> usize {
    1_000
}

impl JobConfig {
    /// Create a job configuration with default settings
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            filter: ChannelFilter::default(),
            bit_expansion: BitExpansion::default(),
            row_cap: RowCapMode::default(),
            split_on_cap: true,
            split_channels: true,
            malformed_rows: MalformedPolicy::default(),
            fail_fast: true,
            flush_rows: default_flush_rows(),
            progress_interval_ms: default_progress_interval(),
            max_warnings: default_max_warnings(),
        }
    }

    /// Builder method: set the channel filter
    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Builder method: set the bit expansion mode
    pub fn with_bit_expansion(mut self, mode: BitExpansion) -> Self {
        self.bit_expansion = mode;
        self
    }

    /// Builder method: set the row cap
    pub fn with_row_cap(mut self, cap: RowCapMode) -> Self {
        self.row_cap = cap;
        self
    }

    /// Builder method: enable or disable `_partNNN` roll-over
    pub fn with_split_on_cap(mut self, enabled: bool) -> Self {
        self.split_on_cap = enabled;
        self
    }

    /// Builder method: write one file per channel or one combined file
    pub fn with_split_channels(mut self, enabled: bool) -> Self {
        self.split_channels = enabled;
        self
    }

    /// Builder method: set the malformed-row policy
    pub fn with_malformed_rows(mut self, policy: MalformedPolicy) -> Self {
        self.malformed_rows = policy;
        self
    }

    /// Builder method: enable or disable fail-fast
    pub fn with_fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Builder method: set the flush batch size
    pub fn with_flush_rows(mut self, rows: usize) -> Self {
        self.flush_rows = rows;
        self
    }

    /// Builder method: set the progress cadence
    pub fn with_progress_interval_ms(mut self, interval_ms: u64) -> Self {
        self.progress_interval_ms = interval_ms;
        self
    }

    /// Builder method: set the warning retention limit
    pub fn with_max_warnings(mut self, limit: usize) -> Self {
        self.max_warnings = limit;
        self
    }

    /// Output base path with any `.csv` extension removed
    pub fn output_stem(&self) -> PathBuf {
        strip_csv_extension(&self.output)
    }
}

fn strip_csv_extension(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

/// Decides whether a frame is decoded at all
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    /// Optional: only decode frames from these channels
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,

    /// Optional: only decode these message ids
    #[serde(default)]
    pub message_ids: Option<Vec<u32>>,
}

impl ChannelFilter {
    /// A filter that allows everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set channel allow-list
    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Builder method: set message-id allow-list
    pub fn with_message_ids(mut self, ids: Vec<u32>) -> Self {
        self.message_ids = Some(ids);
        self
    }

    /// Check if a channel is enabled
    pub fn should_process_channel(&self, channel: Channel) -> bool {
        match &self.channels {
            Some(channels) => channels.contains(&channel),
            None => true,
        }
    }

    /// Check if a message id is enabled (an empty list allows every id)
    pub fn should_process_message(&self, message_id: u32) -> bool {
        match &self.message_ids {
            Some(ids) if !ids.is_empty() => ids.contains(&message_id),
            _ => true,
        }
    }

    /// Check if a frame should be decoded
    pub fn allows(&self, channel: Channel, message_id: u32) -> bool {
        self.should_process_channel(channel) && self.should_process_message(message_id)
    }

    /// Enabled channels in tie-break order, without duplicates
    pub fn enabled_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.should_process_channel(*c))
            .collect()
    }
}

/// Bit expansion of `bitfield` signals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitExpansion {
    /// Composite value only
    #[default]
    Off,
    /// Composite value followed by one boolean column per bit
    Append,
    /// Per-bit boolean columns only
    Replace,
}

/// Row cap applied to every output file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowCapMode {
    /// `.xlsx` limit
    #[default]
    Modern,
    /// `.xls` limit
    Legacy,
    /// Explicit number of data rows
    Custom(u64),
}

impl RowCapMode {
    /// Maximum number of data rows per file (the header takes one sheet row)
    pub fn data_rows(&self) -> u64 {
        match self {
            RowCapMode::Modern => EXCEL_XLSX_MAX_ROWS - 1,
            RowCapMode::Legacy => EXCEL_XLS_MAX_ROWS - 1,
            RowCapMode::Custom(rows) => *rows,
        }
    }
}

/// Handling of rows that cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Skip the row and record a warning
    #[default]
    Skip,
    /// Stop the pipeline with an error
    Abort,
}
