//! CAN CSV Decoder Library
//!
//! Streams a CSV capture of raw CAN frames from a two-bus logger (CAN0 and
//! CAN1), decodes each frame into physical signal values using a signal
//! table, and writes spreadsheet-sized CSV files.
//!
//! # Architecture
//!
//! - One bus pipeline per enabled channel, each on its own thread with its
//!   own reader and output stream
//! - Fixed, bounded memory: the capture is never held in memory
//! - Output files are capped at the Excel row limits and roll over into
//!   `_partNNN` files
//! - Cooperative cancellation at row boundaries and live progress snapshots
//!
//! # Example Usage
//!
//! ```no_run
//! use can_csv_decoder::{BitExpansion, Job, JobConfig, JobOutcome, SignalTable};
//! use std::sync::Arc;
//!
//! // Built-in preset or a CSV/JSON signal table
//! let table = SignalTable::builtin("wavesculptor-orion").unwrap();
//!
//! let config = JobConfig::new("drive_day.csv", "decoded/drive_day.csv")
//!     .with_bit_expansion(BitExpansion::Append);
//!
//! match Job::run(config, Arc::new(table)) {
//!     JobOutcome::Completed(report) => {
//!         for path in &report.outputs {
//!             println!("wrote {}", path.display());
//!         }
//!     }
//!     JobOutcome::Cancelled(_) => eprintln!("cancelled"),
//!     JobOutcome::Failed { error, .. } => eprintln!("decode failed: {}", error),
//! }
//! ```

// Public modules
pub mod cancel;
pub mod config;
pub mod formats;
pub mod job;
pub mod message_decoder;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod signals;
pub mod types;

// Re-export main types for convenience
pub use cancel::CancellationToken;
pub use config::{BitExpansion, ChannelFilter, JobConfig, MalformedPolicy, RowCapMode};
pub use formats::{CsvFrameReader, FrameSource};
pub use job::{Job, JobHandle};
pub use message_decoder::{DecodedFrame, FrameDecoder};
pub use output::{OutputSchema, PartitionCursor, PartitionedCsvWriter, RowSink, Segment};
pub use pipeline::{BusPipeline, PipelineOutcome};
pub use progress::{ChannelProgress, JobState, ProgressSnapshot};
pub use report::{ChannelSummary, JobOutcome, JobReport, JobWarning};
pub use signals::{
    parse_hex_id, ByteOrder, SignalDefinition, SignalKind, SignalTable, TableStats, BUILTIN_PRESETS,
};
pub use types::{Channel, DecodedRow, DecoderError, RawFrameRecord, Result, SignalValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
