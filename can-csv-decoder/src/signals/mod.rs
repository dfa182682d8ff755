//! Signal table and its loaders
//!
//! This module contains the read-only signal table, the CSV/JSON table file
//! loaders and the built-in presets.

pub mod builtin;
pub mod database;
pub mod table_file;

// Re-export key types for convenience
pub use builtin::BUILTIN_PRESETS;
pub use database::{ByteOrder, SignalDefinition, SignalKind, SignalTable, TableStats};
pub use table_file::parse_hex_id;
