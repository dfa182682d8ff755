//! Output writer
//!
//! Decoded rows are projected onto a fixed column schema and written as CSV.
//! Every output stream is capped at a spreadsheet-friendly number of data
//! rows; when roll-over is enabled a full file is closed and the stream
//! continues in `<base>_part002.csv`, `<base>_part003.csv`, ...
//!
//! Combined (single file) output is produced in two steps: each pipeline
//! spools its rows to a private temporary file, then [`merge_spools`] merges
//! the spools by timestamp into one partitioned stream.

use crate::report::JobWarning;
use crate::types::{Channel, DecodedRow, DecoderError, Result};
use csv::StringRecord;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Destination for decoded rows
pub trait RowSink {
    /// Append one row; may buffer
    fn append(&mut self, row: &DecodedRow) -> Result<()>;

    /// Rows accepted so far
    fn rows_written(&self) -> u64;

    /// Push buffered rows to the underlying storage
    fn flush(&mut self) -> Result<()>;
}

/// In-memory sink, handy for tests and embedding
impl RowSink for Vec<DecodedRow> {
    fn append(&mut self, row: &DecodedRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fixed column layout of an output stream
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl OutputSchema {
    /// Leading columns present in every file
    pub const FIXED_COLUMNS: [&'static str; 2] = ["timestamp", "channel"];

    pub fn new(signal_columns: Vec<String>) -> Self {
        let index = signal_columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            columns: signal_columns,
            index,
        }
    }

    pub fn signal_columns(&self) -> &[String] {
        &self.columns
    }

    pub fn header(&self) -> StringRecord {
        let mut header = StringRecord::new();
        for name in Self::FIXED_COLUMNS {
            header.push_field(name);
        }
        for name in &self.columns {
            header.push_field(name);
        }
        header
    }

    /// Project a row onto the schema; columns the row does not carry stay empty
    pub fn encode(&self, row: &DecodedRow) -> StringRecord {
        let mut cells = vec![String::new(); self.columns.len()];
        for (name, value) in &row.values {
            match self.index.get(name) {
                Some(&i) => cells[i] = value.to_string(),
                None => log::trace!("Column '{}' not in output schema", name),
            }
        }

        let mut record = StringRecord::new();
        record.push_field(&row.timestamp.to_string());
        record.push_field(&row.channel.to_string());
        for cell in &cells {
            record.push_field(cell);
        }
        record
    }
}

/// A run of consecutive rows that land in the same part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// 1-based part number
    pub part: u32,
    pub rows: u64,
}

/// Deterministic placement of rows into capped parts
///
/// A new part is only opened when a row actually needs it, so a stream that
/// ends exactly at the cap does not leave an empty trailing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    cap: u64,
    part: u32,
    rows_in_part: u64,
}

impl PartitionCursor {
    /// Cursor that rolls over every `cap` rows (`cap` must be at least 1)
    pub fn new(cap: u64) -> Self {
        Self {
            cap: cap.max(1),
            part: 1,
            rows_in_part: 0,
        }
    }

    /// Cursor that never rolls over
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Current part number
    pub fn part(&self) -> u32 {
        self.part
    }

    /// Place the next `rows` rows, advancing the cursor
    pub fn place(&mut self, rows: u64) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut remaining = rows;
        while remaining > 0 {
            if self.rows_in_part == self.cap {
                self.part += 1;
                self.rows_in_part = 0;
            }
            let take = remaining.min(self.cap - self.rows_in_part);
            segments.push(Segment {
                part: self.part,
                rows: take,
            });
            self.rows_in_part += take;
            remaining -= take;
        }
        segments
    }
}

/// Append `suffix` to the file name of `path`
pub fn with_file_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Base path of a per-channel stream: `<stem>_can0`
pub fn channel_base(stem: &Path, channel: Channel) -> PathBuf {
    with_file_suffix(stem, &format!("_{}", channel.file_tag()))
}

/// File of part `part` of the stream at `base`
pub fn part_path(base: &Path, part: u32) -> PathBuf {
    if part <= 1 {
        with_file_suffix(base, ".csv")
    } else {
        with_file_suffix(base, &format!("_part{:03}.csv", part))
    }
}

/// CSV writer that batches rows and rolls over at the row cap
pub struct PartitionedCsvWriter {
    base: PathBuf,
    schema: OutputSchema,
    cap: u64,
    split_on_cap: bool,
    flush_rows: usize,
    cursor: PartitionCursor,
    batch: Vec<StringRecord>,
    writer: Option<(u32, csv::Writer<File>)>,
    paths: Vec<PathBuf>,
    rows_written: u64,
    cap_exceeded: bool,
}

impl PartitionedCsvWriter {
    /// Create a writer for the stream at `base` (no extension)
    ///
    /// Nothing is created on disk until the first flush.
    pub fn new(base: PathBuf, schema: OutputSchema, cap: u64, split_on_cap: bool, flush_rows: usize) -> Self {
        let cursor = if split_on_cap {
            PartitionCursor::new(cap)
        } else {
            PartitionCursor::unbounded()
        };
        Self {
            base,
            schema,
            cap,
            split_on_cap,
            flush_rows: flush_rows.max(1),
            cursor,
            batch: Vec::new(),
            writer: None,
            paths: Vec::new(),
            rows_written: 0,
            cap_exceeded: false,
        }
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Files created so far
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// True if the cap was passed with roll-over disabled
    pub fn cap_exceeded(&self) -> bool {
        self.cap_exceeded
    }

    /// Append an already encoded record
    pub fn append_record(&mut self, record: StringRecord) -> Result<()> {
        self.batch.push(record);
        if self.batch.len() >= self.flush_rows {
            self.flush_batch()?;
        }
        Ok(())
    }

    /// Flush and close the stream, returning every file it wrote
    ///
    /// A stream that received no rows still gets a header-only file.
    pub fn finish(mut self) -> Result<FinishedStream> {
        self.flush_batch()?;
        if self.writer.is_none() {
            self.open_part(1)?;
        }
        if let Some((_, mut writer)) = self.writer.take() {
            writer.flush()?;
        }

        let warning = self.cap_exceeded.then(|| JobWarning::RowCapExceeded {
            path: part_path(&self.base, 1),
            cap: self.cap,
        });
        log::debug!(
            "Closed output stream {:?}: {} rows in {} file(s)",
            self.base,
            self.rows_written,
            self.paths.len()
        );

        Ok(FinishedStream {
            paths: self.paths,
            rows: self.rows_written,
            warning,
        })
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.batch);
        let mut records = batch.into_iter();
        for segment in self.cursor.place(records.len() as u64) {
            if self.writer.as_ref().map(|(part, _)| *part) != Some(segment.part) {
                self.open_part(segment.part)?;
            }
            let (_, writer) = self
                .writer
                .as_mut()
                .ok_or_else(|| DecoderError::Internal("output part not open".to_string()))?;
            for record in records.by_ref().take(segment.rows as usize) {
                writer.write_record(&record)?;
            }
            self.rows_written += segment.rows;
        }
        if let Some((_, writer)) = self.writer.as_mut() {
            writer.flush()?;
        }

        if !self.split_on_cap && !self.cap_exceeded && self.rows_written > self.cap {
            self.cap_exceeded = true;
            log::debug!(
                "Output {:?} passed {} data rows; spreadsheet tools may truncate it",
                self.base,
                self.cap
            );
        }
        Ok(())
    }

    fn open_part(&mut self, part: u32) -> Result<()> {
        if let Some((_, mut previous)) = self.writer.take() {
            previous.flush()?;
        }

        let path = part_path(&self.base, part);
        log::debug!("Opening output part {}: {:?}", part, path);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&self.schema.header())?;
        self.paths.push(path);
        self.writer = Some((part, writer));
        Ok(())
    }
}

impl RowSink for PartitionedCsvWriter {
    fn append(&mut self, row: &DecodedRow) -> Result<()> {
        let record = self.schema.encode(row);
        self.append_record(record)
    }

    fn rows_written(&self) -> u64 {
        self.rows_written + self.batch.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_batch()
    }
}

/// Result of closing a partitioned stream
#[derive(Debug)]
pub struct FinishedStream {
    pub paths: Vec<PathBuf>,
    pub rows: u64,
    /// Set when the cap was passed with roll-over disabled
    pub warning: Option<JobWarning>,
}

/// Temporary per-channel file holding encoded rows for a later merge
///
/// The file is deleted when the spool is dropped.
pub struct SpoolWriter {
    channel: Channel,
    schema: OutputSchema,
    writer: csv::Writer<File>,
    path: TempPath,
    flush_rows: u64,
    rows: u64,
}

impl SpoolWriter {
    /// Create a spool next to the final output so the merge stays on one disk
    pub fn create(dir: &Path, channel: Channel, schema: OutputSchema, flush_rows: usize) -> Result<Self> {
        let (file, path) = tempfile::Builder::new()
            .prefix(&format!(".{}-", channel.file_tag()))
            .suffix(".spool.csv")
            .tempfile_in(dir)?
            .into_parts();
        log::debug!("{} spooling to {:?}", channel, path);

        Ok(Self {
            channel,
            schema,
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(file),
            path,
            flush_rows: flush_rows.max(1) as u64,
            rows: 0,
        })
    }

    /// Close the spool for reading
    pub fn finish(mut self) -> Result<Spool> {
        self.writer.flush()?;
        Ok(Spool {
            channel: self.channel,
            path: self.path,
            rows: self.rows,
        })
    }
}

impl RowSink for SpoolWriter {
    fn append(&mut self, row: &DecodedRow) -> Result<()> {
        self.writer.write_record(&self.schema.encode(row))?;
        self.rows += 1;
        if self.rows % self.flush_rows == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// A finished spool
#[derive(Debug)]
pub struct Spool {
    pub channel: Channel,
    pub path: TempPath,
    pub rows: u64,
}

/// Sink owned by one bus pipeline
pub enum ChannelSink {
    /// Writes the channel's own `<stem>_canN.csv` stream
    Direct(PartitionedCsvWriter),
    /// Spools rows for a combined merge
    Spool(SpoolWriter),
}

/// What a channel sink left behind
#[derive(Debug)]
pub enum SinkOutput {
    Stream(FinishedStream),
    Spool(Spool),
}

impl ChannelSink {
    pub fn finish(self) -> Result<SinkOutput> {
        match self {
            ChannelSink::Direct(writer) => writer.finish().map(SinkOutput::Stream),
            ChannelSink::Spool(spool) => spool.finish().map(SinkOutput::Spool),
        }
    }
}

impl RowSink for ChannelSink {
    fn append(&mut self, row: &DecodedRow) -> Result<()> {
        match self {
            ChannelSink::Direct(writer) => writer.append(row),
            ChannelSink::Spool(spool) => spool.append(row),
        }
    }

    fn rows_written(&self) -> u64 {
        match self {
            ChannelSink::Direct(writer) => writer.rows_written(),
            ChannelSink::Spool(spool) => spool.rows_written(),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            ChannelSink::Direct(writer) => writer.flush(),
            ChannelSink::Spool(spool) => spool.flush(),
        }
    }
}

/// Head of one spool during a merge
struct SpoolCursor {
    records: csv::StringRecordsIntoIter<File>,
    head: Option<(f64, StringRecord)>,
}

impl SpoolCursor {
    fn open(spool: &Spool) -> Result<Self> {
        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&spool.path)?
            .into_records();
        let mut cursor = Self { records, head: None };
        cursor.advance()?;
        Ok(cursor)
    }

    fn advance(&mut self) -> Result<()> {
        self.head = match self.records.next() {
            None => None,
            Some(record) => {
                let record = record?;
                let timestamp = record
                    .get(0)
                    .and_then(|t| t.parse::<f64>().ok())
                    .ok_or_else(|| DecoderError::Internal(format!("unreadable spool timestamp: {:?}", record.get(0))))?;
                Some((timestamp, record))
            }
        };
        Ok(())
    }
}

/// Merge channel spools into `writer` ordered by timestamp
///
/// Ties go to the earlier channel (CAN0 before CAN1); rows of one channel
/// keep their spooled order. Returns the number of merged rows.
pub fn merge_spools(mut spools: Vec<Spool>, writer: &mut PartitionedCsvWriter) -> Result<u64> {
    spools.sort_by_key(|s| s.channel);
    let mut cursors = spools.iter().map(SpoolCursor::open).collect::<Result<Vec<_>>>()?;

    let mut merged = 0u64;
    loop {
        let mut next: Option<(usize, f64)> = None;
        for (i, cursor) in cursors.iter().enumerate() {
            if let Some((timestamp, _)) = &cursor.head {
                if next.map_or(true, |(_, best)| *timestamp < best) {
                    next = Some((i, *timestamp));
                }
            }
        }
        let Some((i, _)) = next else { break };

        if let Some((_, record)) = cursors[i].head.take() {
            writer.append_record(record)?;
            merged += 1;
        }
        cursors[i].advance()?;
    }

    log::debug!("Merged {} spooled rows from {} channel(s)", merged, spools.len());
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalValue;
    use tempfile::TempDir;

    fn row(timestamp: f64, channel: Channel, speed: f64) -> DecodedRow {
        DecodedRow {
            timestamp,
            channel,
            message_id: 0x100,
            values: vec![("Speed".to_string(), SignalValue::Float(speed))],
        }
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    fn schema() -> OutputSchema {
        OutputSchema::new(vec!["Speed".to_string(), "Status".to_string()])
    }

    #[test]
    fn test_partition_cursor() {
        let mut cursor = PartitionCursor::new(2);
        assert_eq!(
            cursor.place(5),
            vec![
                Segment { part: 1, rows: 2 },
                Segment { part: 2, rows: 2 },
                Segment { part: 3, rows: 1 },
            ]
        );
        assert_eq!(cursor.place(1), vec![Segment { part: 3, rows: 1 }]);
        assert!(cursor.place(0).is_empty());
    }

    #[test]
    fn test_partition_cursor_is_batch_independent() {
        let mut whole = PartitionCursor::new(3);
        let mut pieces = PartitionCursor::new(3);

        let expected: Vec<u32> = whole
            .place(10)
            .iter()
            .flat_map(|s| std::iter::repeat(s.part).take(s.rows as usize))
            .collect();
        let actual: Vec<u32> = [1u64, 4, 2, 3]
            .iter()
            .flat_map(|&n| pieces.place(n))
            .flat_map(|s| std::iter::repeat(s.part).take(s.rows as usize))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_exact_cap_does_not_open_extra_part() {
        let mut cursor = PartitionCursor::new(4);
        cursor.place(4);
        assert_eq!(cursor.part(), 1);
    }

    #[test]
    fn test_part_paths() {
        let base = Path::new("out/run_can0");
        assert_eq!(part_path(base, 1), PathBuf::from("out/run_can0.csv"));
        assert_eq!(part_path(base, 2), PathBuf::from("out/run_can0_part002.csv"));
        assert_eq!(
            channel_base(Path::new("out/run"), Channel::Can1),
            PathBuf::from("out/run_can1")
        );
    }

    #[test]
    fn test_schema_projection() {
        let schema = schema();
        assert_eq!(
            schema.header().iter().collect::<Vec<_>>(),
            vec!["timestamp", "channel", "Speed", "Status"]
        );
        let record = schema.encode(&row(1.5, Channel::Can0, 50.0));
        assert_eq!(record.iter().collect::<Vec<_>>(), vec!["1.5", "CAN0", "50", ""]);
    }

    #[test]
    fn test_writer_splits_at_cap() {
        let dir = TempDir::new().unwrap();
        let mut writer = PartitionedCsvWriter::new(dir.path().join("run"), schema(), 2, true, 3);
        for i in 0..5 {
            writer.append(&row(i as f64, Channel::Can0, 1.0)).unwrap();
        }
        let finished = writer.finish().unwrap();

        assert_eq!(finished.rows, 5);
        assert!(finished.warning.is_none());
        assert_eq!(
            finished.paths,
            vec![
                dir.path().join("run.csv"),
                dir.path().join("run_part002.csv"),
                dir.path().join("run_part003.csv"),
            ]
        );
        let counts: Vec<usize> = finished.paths.iter().map(|p| read_rows(p).len()).collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_writer_without_split_warns_once() {
        let dir = TempDir::new().unwrap();
        let mut writer = PartitionedCsvWriter::new(dir.path().join("run"), schema(), 2, false, 1);
        for i in 0..5 {
            writer.append(&row(i as f64, Channel::Can0, 1.0)).unwrap();
        }
        let finished = writer.finish().unwrap();

        assert_eq!(finished.paths.len(), 1);
        assert_eq!(read_rows(&finished.paths[0]).len(), 5);
        assert!(matches!(finished.warning, Some(JobWarning::RowCapExceeded { cap: 2, .. })));
    }

    #[test]
    fn test_empty_stream_gets_header_only_file() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionedCsvWriter::new(dir.path().join("empty"), schema(), 10, true, 10);
        let finished = writer.finish().unwrap();

        assert_eq!(finished.paths, vec![dir.path().join("empty.csv")]);
        let text = std::fs::read_to_string(&finished.paths[0]).unwrap();
        assert_eq!(text.trim_end(), "timestamp,channel,Speed,Status");
    }

    #[test]
    fn test_merge_orders_by_timestamp_with_can0_first() {
        let dir = TempDir::new().unwrap();

        let mut can0 = SpoolWriter::create(dir.path(), Channel::Can0, schema(), 10).unwrap();
        for (t, v) in [(1.0, 1.0), (2.0, 2.0), (2.0, 3.0)] {
            can0.append(&row(t, Channel::Can0, v)).unwrap();
        }
        let mut can1 = SpoolWriter::create(dir.path(), Channel::Can1, schema(), 10).unwrap();
        for (t, v) in [(0.5, 10.0), (2.0, 11.0), (3.0, 12.0)] {
            can1.append(&row(t, Channel::Can1, v)).unwrap();
        }
        let spools = vec![can1.finish().unwrap(), can0.finish().unwrap()];
        let spool_paths: Vec<PathBuf> = spools.iter().map(|s| s.path.to_path_buf()).collect();

        let mut writer = PartitionedCsvWriter::new(dir.path().join("all"), schema(), 100, true, 2);
        assert_eq!(merge_spools(spools, &mut writer).unwrap(), 6);
        let finished = writer.finish().unwrap();

        let order: Vec<(String, String)> = read_rows(&finished.paths[0])
            .into_iter()
            .map(|r| (r[1].clone(), r[2].clone()))
            .collect();
        let expected = [
            ("CAN1", "10"),
            ("CAN0", "1"),
            ("CAN0", "2"),
            ("CAN0", "3"),
            ("CAN1", "11"),
            ("CAN1", "12"),
        ];
        assert_eq!(
            order,
            expected
                .iter()
                .map(|(c, v)| (c.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        );

        // Spools are removed once merged
        assert!(spool_paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_vec_sink() {
        let mut sink: Vec<DecodedRow> = Vec::new();
        RowSink::append(&mut sink, &row(0.0, Channel::Can1, 4.0)).unwrap();
        assert_eq!(sink.rows_written(), 1);
    }
}
