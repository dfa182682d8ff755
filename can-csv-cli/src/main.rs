//! CAN CSV Decoder CLI Application
//!
//! Command line front end for the can-csv-decoder library:
//! - Builds a job configuration from flags and/or a TOML file
//! - Loads a signal table (CSV, JSON or a built-in preset)
//! - Runs the decode job while logging progress
//! - Prints a summary report (and optionally writes it as JSON)

use anyhow::{bail, Context, Result};
use can_csv_decoder::{BitExpansion, Job, JobOutcome, RowCapMode, BUILTIN_PRESETS};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod report;

/// CAN CSV Decoder - Decode two-bus CAN captures into spreadsheet-sized CSV files
#[derive(Parser, Debug)]
#[command(name = "can-csv-cli")]
#[command(about = "Decode CSV captures of raw CAN frames into signal CSV files", long_about = None)]
#[command(version)]
struct Args {
    /// CSV capture of raw frames (timestamp, channel, id, data)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Signal table (.csv/.json) or builtin:NAME
    #[arg(short, long, value_name = "SOURCE")]
    signals: Option<String>,

    /// Output base path (default: <input>_decoded.csv)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only decode this channel (can be repeated: --channel can0 --channel can1)
    #[arg(long = "channel", value_name = "CHANNEL")]
    channels: Vec<String>,

    /// Only decode this message id, in hex (can be repeated)
    #[arg(long = "message-id", value_name = "HEX")]
    message_ids: Vec<String>,

    /// Per-bit columns for bitfield signals
    #[arg(long, value_enum, value_name = "MODE")]
    expand_bits: Option<ExpandBits>,

    /// Cap files at the legacy .xls row limit (65 535 data rows)
    #[arg(long, conflicts_with = "row_cap")]
    legacy_xls: bool,

    /// Cap files at N data rows
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    row_cap: Option<u64>,

    /// Write one time-ordered file instead of one file per channel
    #[arg(long)]
    combined: bool,

    /// Keep writing past the row cap instead of starting a new part
    #[arg(long)]
    no_split_on_cap: bool,

    /// Stop at the first malformed input row
    #[arg(long)]
    abort_on_malformed: bool,

    /// Let the other channel finish when one pipeline fails
    #[arg(long)]
    keep_going: bool,

    /// Write the job report as JSON
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// List built-in signal tables and exit
    #[arg(long)]
    list_presets: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExpandBits {
    Off,
    Append,
    Replace,
}

impl From<ExpandBits> for BitExpansion {
    fn from(mode: ExpandBits) -> Self {
        match mode {
            ExpandBits::Off => BitExpansion::Off,
            ExpandBits::Append => BitExpansion::Append,
            ExpandBits::Replace => BitExpansion::Replace,
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN CSV Decoder CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using decoder library v{}", can_csv_decoder::VERSION);

    if args.list_presets {
        for name in BUILTIN_PRESETS {
            println!("builtin:{}", name);
        }
        return Ok(());
    }

    run(args)
}

fn run(args: Args) -> Result<()> {
    let file_config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => config::AppConfig::default(),
    };

    let row_cap = if args.legacy_xls {
        Some(RowCapMode::Legacy)
    } else {
        args.row_cap.map(RowCapMode::Custom)
    };
    let overrides = config::Overrides {
        input: args.input,
        signals: args.signals,
        output: args.output,
        channels: args.channels,
        message_ids: args.message_ids,
        expand_bits: args.expand_bits.map(BitExpansion::from),
        row_cap,
        combined: args.combined,
        no_split_on_cap: args.no_split_on_cap,
        abort_on_malformed: args.abort_on_malformed,
        keep_going: args.keep_going,
    };
    let settings = config::resolve(file_config, overrides)?;

    let table = config::load_signal_table(&settings.signals)?;
    let stats = table.stats();
    log::info!(
        "Signal table: {} signals in {} messages",
        stats.num_signals,
        stats.num_messages
    );

    let handle = Job::start(settings.job, Arc::new(table));
    let mut last_logged = -10i64;
    for snapshot in handle.progress_updates() {
        let percent = (snapshot.fraction * 100.0).floor() as i64;
        if percent / 10 > last_logged / 10 {
            log::info!("{:>3}% ({} rows written)", percent, snapshot.rows_written());
            last_logged = percent;
        } else {
            log::debug!("{:>3}% ({} rows written)", percent, snapshot.rows_written());
        }
    }

    let (title, report) = match handle.result() {
        JobOutcome::Completed(report) => ("Decode complete", report),
        JobOutcome::Cancelled(report) => ("Decode cancelled (partial output)", report),
        JobOutcome::Failed { error, warnings } => {
            if !args.quiet {
                let mut text = String::new();
                report::render_warnings(&mut text, &warnings, 0);
                eprint!("{}", text);
            }
            bail!("decode failed: {}", error);
        }
    };

    if !args.quiet {
        print!("{}", report::render_summary(title, &report));
    }
    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report: {:?}", path))?;
        log::info!("Report written to {:?}", path);
    }

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
