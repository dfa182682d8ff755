//! Bus pipeline
//!
//! One pipeline per enabled channel. A pipeline pulls raw frames from its own
//! reader, decodes the ones the filter and signal table accept, and appends
//! the decoded rows to a sink it owns. Pipelines share nothing mutable except
//! the cancellation token; their counters are written by the pipeline alone.
//!
//! Per frame:
//! 1. Channel filter rejects the frame → skip
//! 2. No signal definitions for the message → skip (not a warning)
//! 3. Otherwise decode, record truncated signals, append the row; a signal
//!    cut off by a short payload leaves its cell empty

use crate::cancel::CancellationToken;
use crate::config::{BitExpansion, ChannelFilter, JobConfig, MalformedPolicy};
use crate::message_decoder::FrameDecoder;
use crate::output::RowSink;
use crate::progress::PipelineCounters;
use crate::report::{JobWarning, WarningLog};
use crate::signals::SignalTable;
use crate::types::{Channel, DecodedRow, DecoderError, RawFrameRecord, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Decode loop for a single bus
pub struct BusPipeline {
    channel: Channel,
    table: Arc<SignalTable>,
    filter: ChannelFilter,
    expansion: BitExpansion,
    malformed_rows: MalformedPolicy,
    counters: Arc<PipelineCounters>,
    cancel: CancellationToken,
    warnings: WarningLog,
}

/// How a pipeline ended
#[derive(Debug)]
pub struct PipelineOutcome {
    pub channel: Channel,
    pub rows_read: u64,
    pub rows_decoded: u64,
    pub rows_written: u64,
    pub warnings: WarningLog,
    /// Stopped because the cancellation token was set
    pub cancelled: bool,
    /// Fatal error that ended the pipeline early
    pub error: Option<DecoderError>,
}

impl BusPipeline {
    pub fn new(
        channel: Channel,
        table: Arc<SignalTable>,
        config: &JobConfig,
        counters: Arc<PipelineCounters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            table,
            filter: config.filter.clone(),
            expansion: config.bit_expansion,
            malformed_rows: config.malformed_rows,
            counters,
            cancel,
            warnings: WarningLog::new(config.max_warnings),
        }
    }

    /// Run until the frames are exhausted, cancellation, or a fatal error
    ///
    /// The sink is flushed on every exit path; closing it is left to the
    /// owner so that it can decide what to do with partial output.
    pub fn run<I, S>(mut self, frames: I, sink: &mut S) -> PipelineOutcome
    where
        I: Iterator<Item = Result<RawFrameRecord>>,
        S: RowSink + ?Sized,
    {
        log::debug!("{} pipeline started", self.channel);

        let mut cancelled = false;
        let mut error = self.drive(frames, sink, &mut cancelled).err();

        if let Err(e) = sink.flush() {
            if error.is_none() {
                error = Some(e);
            }
        }
        PipelineCounters::set(&self.counters.rows_written, sink.rows_written());

        let outcome = PipelineOutcome {
            channel: self.channel,
            rows_read: PipelineCounters::get(&self.counters.rows_read),
            rows_decoded: PipelineCounters::get(&self.counters.rows_decoded),
            rows_written: sink.rows_written(),
            warnings: self.warnings,
            cancelled,
            error,
        };

        match &outcome.error {
            Some(e) => log::error!("{} pipeline stopped: {}", outcome.channel, e),
            None if cancelled => log::info!(
                "{} pipeline cancelled after {} rows",
                outcome.channel,
                outcome.rows_written
            ),
            None => log::debug!(
                "{} pipeline finished: {} read, {} decoded, {} written",
                outcome.channel,
                outcome.rows_read,
                outcome.rows_decoded,
                outcome.rows_written
            ),
        }
        outcome
    }

    fn drive<I, S>(&mut self, mut frames: I, sink: &mut S, cancelled: &mut bool) -> Result<()>
    where
        I: Iterator<Item = Result<RawFrameRecord>>,
        S: RowSink + ?Sized,
    {
        loop {
            if self.cancel.is_cancelled() {
                *cancelled = true;
                return Ok(());
            }
            let Some(item) = frames.next() else {
                return Ok(());
            };

            match item {
                Ok(frame) => {
                    self.scanned(frame.line);
                    PipelineCounters::add(&self.counters.rows_read, 1);
                    if let Some(row) = self.decode(frame) {
                        sink.append(&row)?;
                        PipelineCounters::set(&self.counters.rows_written, sink.rows_written());
                    }
                }
                Err(DecoderError::MalformedInput { line, reason }) => {
                    self.scanned(line);
                    match self.malformed_rows {
                        MalformedPolicy::Skip => self.warn(JobWarning::MalformedRow { line, reason }),
                        MalformedPolicy::Abort => {
                            return Err(DecoderError::MalformedInput { line, reason })
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decode one frame, or `None` if it is not wanted
    fn decode(&mut self, frame: RawFrameRecord) -> Option<DecodedRow> {
        if !self.filter.allows(frame.channel, frame.message_id) {
            log::trace!("Filtered out {} 0x{:X}", frame.channel, frame.message_id);
            return None;
        }

        let signals = match self.table.require(frame.channel, frame.message_id) {
            Ok(signals) => signals,
            Err(unknown) => {
                log::trace!("Skipped: {}", unknown);
                return None;
            }
        };

        let decoded = FrameDecoder::decode(&frame, signals, self.expansion);
        for truncated in decoded.truncated {
            self.warn(JobWarning::TruncatedSignal {
                channel: frame.channel,
                message_id: frame.message_id,
                line: frame.line,
                signal: truncated.name,
                required: truncated.required,
                available: truncated.available,
            });
        }

        PipelineCounters::add(&self.counters.rows_decoded, 1);
        Some(DecodedRow {
            timestamp: frame.timestamp,
            channel: frame.channel,
            message_id: frame.message_id,
            values: decoded.values,
        })
    }

    fn warn(&mut self, warning: JobWarning) {
        PipelineCounters::add(&self.counters.warnings, 1);
        self.warnings.push(warning);
    }

    /// Data lines consumed so far (the header is line 1)
    fn scanned(&self, line: u64) {
        self.counters
            .lines_scanned
            .fetch_max(line.saturating_sub(1), Ordering::Relaxed);
    }
}
