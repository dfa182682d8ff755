//! CSV capture reader
//!
//! Streams raw CAN frames out of a CSV capture one record at a time using the
//! `csv` crate over a buffered file. The whole file is never held in memory.
//!
//! ## Expected columns
//! Matched case-insensitively after trimming; extra columns are ignored.
//! - `timestamp` (or `time`, `ts`): seconds as a float, or an RFC 3339 /
//!   `YYYY-MM-DD HH:MM:SS[.f]` date-time (UTC)
//! - `channel` (or `bus`): `can0` / `can1`
//! - `id` (or `can_id`, `message_id`, `arbitration_id`): hexadecimal
//! - `data` (or `payload`, `bytes`): hex byte pairs, optionally separated by
//!   whitespace, at most 8 bytes

use crate::formats::FrameSource;
use crate::signals::table_file::parse_hex_id;
use crate::types::{Channel, DecoderError, RawFrameRecord, Result, MAX_PAYLOAD_BYTES};
use chrono::{DateTime, NaiveDateTime};
use csv::StringRecord;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "time", "ts"];
const CHANNEL_ALIASES: &[&str] = &["channel", "bus"];
const ID_ALIASES: &[&str] = &["id", "can_id", "message_id", "arbitration_id"];
const DATA_ALIASES: &[&str] = &["data", "payload", "bytes"];

/// Positions of the required columns in the header
#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    timestamp: usize,
    channel: usize,
    id: usize,
    data: usize,
}

impl ColumnMap {
    fn from_header(header: &StringRecord) -> Result<Self> {
        let find = |aliases: &[&str]| {
            header
                .iter()
                .position(|h| aliases.contains(&h.trim().to_ascii_lowercase().as_str()))
                .ok_or_else(|| DecoderError::MalformedInput {
                    line: 1,
                    reason: format!("missing '{}' column in header", aliases[0]),
                })
        };
        Ok(Self {
            timestamp: find(TIMESTAMP_ALIASES)?,
            channel: find(CHANNEL_ALIASES)?,
            id: find(ID_ALIASES)?,
            data: find(DATA_ALIASES)?,
        })
    }
}

/// Streaming reader over a CSV capture
///
/// Yields `Result<RawFrameRecord>`; finite and not restartable. A fresh
/// reader is needed to read the file again.
pub struct CsvFrameReader {
    path: PathBuf,
    records: csv::StringRecordsIntoIter<BufReader<File>>,
    columns: ColumnMap,
    /// One record of lookahead, to recognise the last line of the file
    lookahead: Option<csv::Result<StringRecord>>,
    ends_with_newline: bool,
    /// Only yield frames from this channel
    channel: Option<Channel>,
    /// Report rows whose channel cannot be parsed even when `channel` is set
    reports_orphans: bool,
}

impl CsvFrameReader {
    /// Builder method: only yield frames recorded on `channel`
    ///
    /// Rows from other channels are skipped without parsing the rest of
    /// their fields. `reports_orphans` decides whether this reader reports
    /// rows whose channel column is unreadable.
    pub fn with_channel(mut self, channel: Channel, reports_orphans: bool) -> Self {
        self.channel = Some(channel);
        self.reports_orphans = reports_orphans;
        self
    }

    /// Path of the capture being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse one record. `Ok(None)` means the row belongs to another channel.
    fn parse_record(&self, record: &StringRecord, line: u64) -> std::result::Result<Option<RawFrameRecord>, String> {
        let field = |index: usize, name: &str| {
            record
                .get(index)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("missing {} field", name))
        };

        let channel = match field(self.columns.channel, "channel")?.parse::<Channel>() {
            Ok(channel) => channel,
            Err(e) if self.reports_orphans || self.channel.is_none() => return Err(e.to_string()),
            Err(_) => return Ok(None),
        };
        if self.channel.is_some_and(|wanted| wanted != channel) {
            return Ok(None);
        }

        let message_id = parse_hex_id(field(self.columns.id, "id")?)?;
        let timestamp = parse_timestamp(field(self.columns.timestamp, "timestamp")?)?;
        let payload = parse_payload(record.get(self.columns.data).ok_or("missing data field")?)?;

        Ok(Some(RawFrameRecord {
            line,
            timestamp,
            channel,
            message_id,
            payload,
        }))
    }
}

impl FrameSource for CsvFrameReader {
    /// Open a capture and validate its header
    fn open(path: &Path) -> Result<Self> {
        log::debug!("Opening CSV capture: {:?}", path);

        let file = File::open(path)?;
        let ends_with_newline = ends_with_newline(&file)?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(BufReader::new(file));

        let header = reader.headers()?.clone();
        let columns = ColumnMap::from_header(&header)?;

        let mut records = reader.into_records();
        let lookahead = records.next();

        Ok(Self {
            path: path.to_path_buf(),
            records,
            columns,
            lookahead,
            ends_with_newline,
            channel: None,
            reports_orphans: true,
        })
    }
}

impl Iterator for CsvFrameReader {
    type Item = Result<RawFrameRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.lookahead.take()?;
            self.lookahead = self.records.next();
            let is_last = self.lookahead.is_none();

            let (line, parsed) = match current {
                Ok(record) => {
                    let line = record.position().map(|p| p.line()).unwrap_or(0);
                    (line, self.parse_record(&record, line))
                }
                Err(e) if e.is_io_error() => return Some(Err(e.into())),
                Err(e) => (e.position().map(|p| p.line()).unwrap_or(0), Err(e.to_string())),
            };

            match parsed {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(reason) if is_last && !self.ends_with_newline => {
                    log::debug!("Discarding partial trailing line {} in {:?}: {}", line, self.path, reason);
                    return None;
                }
                Err(reason) => return Some(Err(DecoderError::MalformedInput { line, reason })),
            }
        }
    }
}

/// Estimate the number of data rows in a capture (line count minus header)
pub fn estimate_rows(path: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = [0u8; 64 * 1024];
    let mut lines = 0u64;
    let mut last = b'\n';
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        lines += buffer[..read].iter().filter(|&&b| b == b'\n').count() as u64;
        last = buffer[read - 1];
    }
    if last != b'\n' {
        lines += 1;
    }
    Ok(lines.saturating_sub(1))
}

fn ends_with_newline(file: &File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    let mut handle = file.try_clone()?;
    handle.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    handle.read_exact(&mut last)?;
    handle.seek(SeekFrom::Start(0))?;
    Ok(last[0] == b'\n')
}

/// Parse a timestamp given as seconds or as a UTC date-time
pub(crate) fn parse_timestamp(text: &str) -> std::result::Result<f64, String> {
    if let Ok(seconds) = text.parse::<f64>() {
        if seconds.is_finite() {
            return Ok(seconds);
        }
    }
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|_| format!("invalid timestamp '{}'", text))?;
    let utc = parsed.and_utc();
    Ok(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) / 1e9)
}

/// Parse hex byte pairs, e.g. `"0A FF 10"` or `"0AFF10"`
pub(crate) fn parse_payload(text: &str) -> std::result::Result<Vec<u8>, String> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(format!("payload '{}' is not hexadecimal", text));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("payload '{}' has an odd number of hex digits", text));
    }
    if digits.len() / 2 > MAX_PAYLOAD_BYTES {
        return Err(format!(
            "payload '{}' is longer than {} bytes",
            text, MAX_PAYLOAD_BYTES
        ));
    }

    let nibble = |c: u8| (c as char).to_digit(16).unwrap_or(0) as u8;
    Ok(digits
        .chunks_exact(2)
        .map(|pair| (nibble(pair[0]) << 4) | nibble(pair[1]))
        .collect())
}
