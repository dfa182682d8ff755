//! Capture file readers
//!
//! Each reader implements an iterator pattern over raw frame records.

use crate::types::{RawFrameRecord, Result};
use std::path::Path;

pub mod csv_log;

// Re-export reader types
pub use csv_log::{estimate_rows, CsvFrameReader};

/// Common trait for capture readers
///
/// A source lazily yields frames in file order and is consumed once; open a
/// new source to read the file again.
pub trait FrameSource: Iterator<Item = Result<RawFrameRecord>> + Sized {
    /// Open a capture and return an iterator over its frames
    fn open(path: &Path) -> Result<Self>;
}
