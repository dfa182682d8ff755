//! Job controller
//!
//! Validates a [`JobConfig`], runs one [`BusPipeline`] per enabled channel on
//! its own thread, publishes progress while they run and assembles the final
//! [`JobOutcome`].
//!
//! # Example
//!
//! ```no_run
//! use can_csv_decoder::{Job, JobConfig, JobOutcome, SignalTable};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let table = SignalTable::load(Path::new("signals.csv")).unwrap();
//! let config = JobConfig::new("capture.csv", "out/decoded.csv");
//!
//! let handle = Job::start(config, Arc::new(table));
//! for snapshot in handle.progress_updates() {
//!     println!("{:.0}%", snapshot.fraction * 100.0);
//! }
//! match handle.result() {
//!     JobOutcome::Completed(report) => println!("{} rows", report.rows_written()),
//!     JobOutcome::Cancelled(report) => println!("cancelled, {:?}", report.outputs),
//!     JobOutcome::Failed { error, .. } => eprintln!("failed: {}", error),
//! }
//! ```

use crate::cancel::CancellationToken;
use crate::config::{JobConfig, RowCapMode};
use crate::formats::{estimate_rows, CsvFrameReader, FrameSource};
use crate::output::{
    channel_base, merge_spools, part_path, ChannelSink, OutputSchema, PartitionedCsvWriter,
    SinkOutput, Spool, SpoolWriter,
};
use crate::pipeline::{BusPipeline, PipelineOutcome};
use crate::progress::{JobState, PipelineCounters, ProgressSnapshot};
use crate::report::{ChannelSummary, JobOutcome, JobReport, JobWarning, WarningLog};
use crate::signals::SignalTable;
use crate::types::{Channel, DecoderError, Result};
use chrono::Utc;
use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Progress updates buffered for a slow consumer; older updates are dropped
const PROGRESS_QUEUE: usize = 64;

/// Entry point for running decode jobs
pub struct Job;

impl Job {
    /// Start a job on a background thread
    ///
    /// Configuration problems are reported through the handle as
    /// `JobOutcome::Failed` with a `Configuration` error.
    pub fn start(config: JobConfig, table: Arc<SignalTable>) -> JobHandle {
        let cancel = CancellationToken::new();
        let latest = Arc::new(Mutex::new(ProgressSnapshot::new(JobState::Running, 0, Vec::new())));
        let (updates_tx, updates_rx) = crossbeam_channel::bounded(PROGRESS_QUEUE);

        let controller = Controller {
            config,
            table,
            cancel: cancel.clone(),
            latest: latest.clone(),
            updates: updates_tx,
            backlog: updates_rx.clone(),
        };
        let thread = thread::spawn(move || controller.run());

        JobHandle {
            cancel,
            latest,
            updates: updates_rx,
            thread,
        }
    }

    /// Run a job to completion on the calling thread
    pub fn run(config: JobConfig, table: Arc<SignalTable>) -> JobOutcome {
        Self::start(config, table).result()
    }
}

/// Handle to a running job
pub struct JobHandle {
    cancel: CancellationToken,
    latest: Arc<Mutex<ProgressSnapshot>>,
    updates: Receiver<ProgressSnapshot>,
    thread: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// Latest published progress
    pub fn progress(&self) -> ProgressSnapshot {
        match self.latest.lock() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stream of progress snapshots; ends when the job finishes
    pub fn progress_updates(&self) -> Receiver<ProgressSnapshot> {
        self.updates.clone()
    }

    /// Ask the pipelines to stop at the next row boundary
    pub fn cancel(&self) {
        log::info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn state(&self) -> JobState {
        self.progress().state
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the job to end
    pub fn result(self) -> JobOutcome {
        self.thread.join().unwrap_or_else(|_| JobOutcome::Failed {
            error: DecoderError::Internal("job controller panicked".to_string()),
            warnings: Vec::new(),
        })
    }
}

/// Everything decided before the pipelines start
struct JobPlan {
    channels: Vec<Channel>,
    stem: PathBuf,
    output_dir: PathBuf,
    estimated_rows: u64,
}

/// One pipeline's result plus what its sink left behind
struct ChannelRun {
    outcome: PipelineOutcome,
    output: Result<SinkOutput>,
}

struct Controller {
    config: JobConfig,
    table: Arc<SignalTable>,
    cancel: CancellationToken,
    latest: Arc<Mutex<ProgressSnapshot>>,
    updates: Sender<ProgressSnapshot>,
    /// Used to drop the oldest queued update when the queue is full
    backlog: Receiver<ProgressSnapshot>,
}

impl Controller {
    fn run(self) -> JobOutcome {
        let started_at = Utc::now();
        log::info!("Starting job: {:?} -> {:?}", self.config.input, self.config.output);

        let outcome = match self.validate() {
            Ok(plan) => self.execute(&plan, started_at),
            Err(error) => {
                log::error!("Job configuration rejected: {}", error);
                JobOutcome::Failed {
                    error,
                    warnings: Vec::new(),
                }
            }
        };

        let state = match &outcome {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Cancelled(_) => JobState::Cancelled,
            JobOutcome::Failed { .. } => JobState::Failed,
        };
        let last = self.progress();
        self.publish(ProgressSnapshot::new(state, last.estimated_rows, last.channels));
        log::info!("Job finished: {:?}", state);
        outcome
    }

    fn validate(&self) -> Result<JobPlan> {
        let config = &self.config;
        let fail = |reason: String| Err(DecoderError::Configuration(reason));

        if self.table.is_empty() {
            return fail("signal table is empty".to_string());
        }
        if config.row_cap == RowCapMode::Custom(0) {
            return fail("custom row cap must be at least 1".to_string());
        }
        if config.flush_rows == 0 {
            return fail("flush batch size must be at least 1".to_string());
        }

        let channels = config.filter.enabled_channels();
        if channels.is_empty() {
            return fail("no channels enabled".to_string());
        }
        if let Some(ids) = config.filter.message_ids.as_ref().filter(|ids| !ids.is_empty()) {
            let known = channels
                .iter()
                .flat_map(|c| self.table.message_ids(*c))
                .any(|id| ids.contains(&id));
            if !known {
                return fail("message id filter matches no signal definitions".to_string());
            }
        }

        match std::fs::metadata(&config.input) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return fail(format!("input {:?} is not a file", config.input)),
            Err(e) => return fail(format!("input {:?}: {}", config.input, e)),
        }
        CsvFrameReader::open(&config.input)
            .map_err(|e| DecoderError::Configuration(format!("input {:?}: {}", config.input, e)))?;

        let stem = config.output_stem();
        if stem.file_name().is_none() {
            return fail(format!("output {:?} has no file name", config.output));
        }
        let output_dir = match stem.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            DecoderError::Configuration(format!("output directory {:?}: {}", output_dir, e))
        })?;

        let input_file = std::fs::canonicalize(&config.input)
            .map_err(|e| DecoderError::Configuration(format!("input {:?}: {}", config.input, e)))?;
        let bases: Vec<PathBuf> = if config.split_channels {
            channels.iter().map(|c| channel_base(&stem, *c)).collect()
        } else {
            vec![stem.clone()]
        };
        if let Some(base) = bases.iter().find(|base| writes_to(base, &input_file)) {
            return fail(format!(
                "output stream {:?} would overwrite the input {:?}",
                part_path(base, 1),
                config.input
            ));
        }

        let estimated_rows = estimate_rows(&config.input)?;
        log::info!(
            "Decoding {} on {} channel(s), ~{} rows",
            config.input.display(),
            channels.len(),
            estimated_rows
        );

        Ok(JobPlan {
            channels,
            stem,
            output_dir,
            estimated_rows,
        })
    }

    fn execute(&self, plan: &JobPlan, started_at: chrono::DateTime<Utc>) -> JobOutcome {
        let config = &self.config;
        let combined = !config.split_channels;
        let combined_schema = OutputSchema::new(self.table.columns(
            &plan.channels,
            &config.filter,
            config.bit_expansion,
        ));

        // Readers and sinks are created up front so that a failure here
        // leaves nothing running.
        let mut lanes = Vec::new();
        for (i, &channel) in plan.channels.iter().enumerate() {
            let lane = self.open_lane(plan, channel, i == 0, &combined_schema);
            match lane {
                Ok((reader, sink)) => {
                    lanes.push((channel, reader, sink, Arc::new(PipelineCounters::default())));
                }
                Err(error) => return self.fail(error, WarningLog::new(config.max_warnings), &[]),
            }
        }
        let counters: Vec<(Channel, Arc<PipelineCounters>)> =
            lanes.iter().map(|(c, _, _, counters)| (*c, counters.clone())).collect();

        let runs = self.run_pipelines(lanes, &counters, plan.estimated_rows);

        let mut warnings = WarningLog::new(config.max_warnings);
        let mut outputs = Vec::new();
        let mut spools: Vec<Spool> = Vec::new();
        let mut summaries = Vec::new();
        let mut failures: Vec<(Channel, DecoderError)> = Vec::new();
        let mut cancelled = self.cancel.is_cancelled();

        for run in runs {
            let ChannelRun { outcome, output } = run;
            let channel = outcome.channel;
            let mut error = outcome.error;
            cancelled |= outcome.cancelled;
            warnings.absorb(outcome.warnings);

            match output {
                Ok(SinkOutput::Stream(stream)) => {
                    outputs.extend(stream.paths);
                    if let Some(warning) = stream.warning {
                        warnings.push(warning);
                    }
                }
                Ok(SinkOutput::Spool(spool)) => spools.push(spool),
                Err(e) => {
                    if error.is_none() {
                        error = Some(e);
                    }
                }
            }

            summaries.push(ChannelSummary {
                channel,
                rows_read: outcome.rows_read,
                rows_decoded: outcome.rows_decoded,
                rows_written: outcome.rows_written,
                warnings: counters
                    .iter()
                    .find(|(c, _)| *c == channel)
                    .map_or(0, |(_, c)| PipelineCounters::get(&c.warnings)),
                error: error.as_ref().map(ToString::to_string),
            });
            if let Some(error) = error {
                failures.push((channel, error));
            }
        }

        let all_failed = failures.len() == summaries.len();
        if !failures.is_empty() && (config.fail_fast || all_failed) {
            let (_, error) = failures.remove(0);
            return self.fail(error, warnings, &outputs);
        }
        for (channel, error) in failures {
            warnings.push(JobWarning::PipelineFailed {
                channel,
                error: error.to_string(),
            });
        }

        if combined && !spools.is_empty() {
            let mut writer = PartitionedCsvWriter::new(
                plan.stem.clone(),
                combined_schema,
                config.row_cap.data_rows(),
                config.split_on_cap,
                config.flush_rows,
            );
            let merged = merge_spools(spools, &mut writer).and_then(|_| writer.finish());
            match merged {
                Ok(stream) => {
                    outputs.extend(stream.paths);
                    if let Some(warning) = stream.warning {
                        warnings.push(warning);
                    }
                }
                Err(error) => return self.fail(error, warnings, &outputs),
            }
        }

        let report = JobReport {
            outputs,
            channels: summaries,
            warnings_suppressed: warnings.suppressed(),
            warnings: warnings.warnings().to_vec(),
            started_at,
            finished_at: Utc::now(),
        };
        log::info!(
            "Wrote {} rows to {} file(s) with {} warning(s)",
            report.rows_written(),
            report.outputs.len(),
            report.warnings.len() as u64 + report.warnings_suppressed
        );

        if cancelled {
            JobOutcome::Cancelled(report)
        } else {
            JobOutcome::Completed(report)
        }
    }

    /// Open the reader and sink of one channel
    fn open_lane(
        &self,
        plan: &JobPlan,
        channel: Channel,
        reports_orphans: bool,
        combined_schema: &OutputSchema,
    ) -> Result<(CsvFrameReader, ChannelSink)> {
        let config = &self.config;
        let reader = CsvFrameReader::open(&config.input)?.with_channel(channel, reports_orphans);
        let cap = config.row_cap.data_rows();

        let sink = if config.split_channels {
            let schema = OutputSchema::new(self.table.columns(
                &[channel],
                &config.filter,
                config.bit_expansion,
            ));
            ChannelSink::Direct(PartitionedCsvWriter::new(
                channel_base(&plan.stem, channel),
                schema,
                cap,
                config.split_on_cap,
                config.flush_rows,
            ))
        } else if plan.channels.len() == 1 {
            ChannelSink::Direct(PartitionedCsvWriter::new(
                plan.stem.clone(),
                combined_schema.clone(),
                cap,
                config.split_on_cap,
                config.flush_rows,
            ))
        } else {
            ChannelSink::Spool(SpoolWriter::create(
                &plan.output_dir,
                channel,
                combined_schema.clone(),
                config.flush_rows,
            )?)
        };
        Ok((reader, sink))
    }

    /// Run every lane on its own scoped thread and wait for all of them
    fn run_pipelines(
        &self,
        lanes: Vec<(Channel, CsvFrameReader, ChannelSink, Arc<PipelineCounters>)>,
        counters: &[(Channel, Arc<PipelineCounters>)],
        estimated_rows: u64,
    ) -> Vec<ChannelRun> {
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(Channel, bool)>();
        let ticker = crossbeam_channel::tick(Duration::from_millis(self.config.progress_interval_ms.max(1)));

        thread::scope(|scope| {
            let mut handles = Vec::new();
            for (channel, reader, mut sink, lane_counters) in lanes {
                let pipeline = BusPipeline::new(
                    channel,
                    self.table.clone(),
                    &self.config,
                    lane_counters,
                    self.cancel.clone(),
                );
                let done_tx = done_tx.clone();
                let handle = scope.spawn(move || {
                    let outcome = pipeline.run(reader, &mut sink);
                    let output = sink.finish();
                    let failed = outcome.error.is_some() || output.is_err();
                    let _ = done_tx.send((channel, failed));
                    ChannelRun { outcome, output }
                });
                handles.push((channel, handle));
            }
            drop(done_tx);

            let mut finished: Vec<Channel> = Vec::new();
            while finished.len() < handles.len() {
                select! {
                    recv(done_rx) -> message => match message {
                        Ok((channel, failed)) => {
                            finished.push(channel);
                            if failed && self.config.fail_fast && !self.cancel.is_cancelled() {
                                log::warn!("{} pipeline failed; stopping the job", channel);
                                self.cancel.cancel();
                            }
                        }
                        // Every sender is gone: the remaining pipelines panicked
                        Err(_) => break,
                    },
                    recv(ticker) -> _ => {
                        self.publish(Self::snapshot(JobState::Running, estimated_rows, counters, &finished));
                    }
                }
            }

            handles
                .into_iter()
                .map(|(channel, handle)| match handle.join() {
                    Ok(run) => run,
                    Err(_) => {
                        log::error!("{} pipeline panicked", channel);
                        ChannelRun {
                            outcome: PipelineOutcome {
                                channel,
                                rows_read: 0,
                                rows_decoded: 0,
                                rows_written: 0,
                                warnings: WarningLog::new(0),
                                cancelled: false,
                                error: Some(DecoderError::Internal(format!("{} pipeline panicked", channel))),
                            },
                            output: Err(DecoderError::Internal("sink lost with its pipeline".to_string())),
                        }
                    }
                })
                .collect()
        })
    }

    /// Fail the job, removing the files it created
    fn fail(&self, error: DecoderError, warnings: WarningLog, created: &[PathBuf]) -> JobOutcome {
        log::error!("Job failed: {}", error);
        remove_outputs(created);
        JobOutcome::Failed {
            error,
            warnings: warnings.warnings().to_vec(),
        }
    }

    fn snapshot(
        state: JobState,
        estimated_rows: u64,
        counters: &[(Channel, Arc<PipelineCounters>)],
        finished: &[Channel],
    ) -> ProgressSnapshot {
        let channels = counters
            .iter()
            .map(|(channel, c)| c.snapshot(*channel, finished.contains(channel)))
            .collect();
        ProgressSnapshot::new(state, estimated_rows, channels)
    }

    fn progress(&self) -> ProgressSnapshot {
        match self.latest.lock() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Store as latest and offer to the update stream without blocking
    fn publish(&self, snapshot: ProgressSnapshot) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = snapshot.clone();
        }
        if let Err(TrySendError::Full(snapshot)) = self.updates.try_send(snapshot) {
            log::trace!("Progress queue full, dropping oldest update");
            let _ = self.backlog.try_recv();
            let _ = self.updates.try_send(snapshot);
        }
    }
}

/// True if any part of the stream at `base` would be the file `target`
///
/// `target` must be canonical. Part files are matched by name in the same
/// directory; the first part is also resolved in case it is a link.
fn writes_to(base: &Path, target: &Path) -> bool {
    let first = part_path(base, 1);
    if std::fs::canonicalize(&first).map_or(false, |path| path == target) {
        return true;
    }

    let (Some(dir), Some(name)) = (base.parent(), base.file_name()) else {
        return false;
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    if std::fs::canonicalize(dir).map_or(true, |dir| Some(dir.as_path()) != target.parent()) {
        return false;
    }

    let (Some(target_name), Some(name)) = (target.file_name().and_then(|n| n.to_str()), name.to_str())
    else {
        return false;
    };
    match target_name.strip_prefix(name) {
        Some(".csv") => true,
        Some(rest) => rest
            .strip_prefix("_part")
            .and_then(|rest| rest.strip_suffix(".csv"))
            .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

fn remove_outputs(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to remove partial output {:?}: {}", path, e);
        } else {
            log::debug!("Removed partial output {:?}", path);
        }
    }
}
