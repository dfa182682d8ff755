//! Configuration loading and parsing
//!
//! Settings come from an optional TOML file and from command line flags.
//! Flags win over file values; anything left unset falls back to the
//! library defaults of [`JobConfig`].

use anyhow::{anyhow, bail, Context, Result};
use can_csv_decoder::{
    BitExpansion, Channel, ChannelFilter, JobConfig, MalformedPolicy, RowCapMode, SignalTable,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub filtering: FilteringConfig,
    #[serde(default)]
    pub decoding: DecodingConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    /// CSV capture to decode
    pub file: Option<PathBuf>,
    /// Signal table file, or `builtin:NAME`
    pub signals: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Output base path
    pub path: Option<PathBuf>,
    pub split_channels: Option<bool>,
    pub split_on_cap: Option<bool>,
    /// `"modern"`, `"legacy"` or a number of data rows
    pub row_cap: Option<RowCapSetting>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RowCapSetting {
    Rows(u64),
    Named(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilteringConfig {
    pub channels: Option<Vec<String>>,
    pub message_ids: Option<Vec<MessageIdSetting>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageIdSetting {
    Number(u32),
    /// Hexadecimal, `0x` prefix optional
    Hex(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecodingConfig {
    pub expand_bits: Option<BitExpansion>,
    pub malformed_rows: Option<MalformedPolicy>,
    pub fail_fast: Option<bool>,
    pub flush_rows: Option<usize>,
    pub progress_interval_ms: Option<u64>,
    pub max_warnings: Option<usize>,
}

/// Values given on the command line; `None` means "not given"
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub input: Option<PathBuf>,
    pub signals: Option<String>,
    pub output: Option<PathBuf>,
    pub channels: Vec<String>,
    pub message_ids: Vec<String>,
    pub expand_bits: Option<BitExpansion>,
    pub row_cap: Option<RowCapMode>,
    pub combined: bool,
    pub no_split_on_cap: bool,
    pub abort_on_malformed: bool,
    pub keep_going: bool,
}

/// Everything needed to start a job
#[derive(Debug, Clone)]
pub struct Settings {
    pub job: JobConfig,
    pub signals: String,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// Merge the config file and command line flags
pub fn resolve(file: AppConfig, cli: Overrides) -> Result<Settings> {
    let input = cli
        .input
        .or(file.input.file)
        .ok_or_else(|| anyhow!("no input capture given (use --input or [input] file)"))?;
    let signals = cli
        .signals
        .or(file.input.signals)
        .ok_or_else(|| anyhow!("no signal table given (use --signals or [input] signals)"))?;
    let output = cli
        .output
        .or(file.output.path)
        .unwrap_or_else(|| default_output(&input));

    let channel_names = if cli.channels.is_empty() {
        file.filtering.channels
    } else {
        Some(cli.channels)
    };
    let mut filter = ChannelFilter::new();
    if let Some(names) = channel_names {
        let channels = names
            .iter()
            .map(|name| name.parse::<Channel>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        filter = filter.with_channels(channels);
    }

    let message_ids = if cli.message_ids.is_empty() {
        file.filtering
            .message_ids
            .map(|ids| {
                ids.into_iter()
                    .map(|id| match id {
                        MessageIdSetting::Number(n) => Ok(n),
                        MessageIdSetting::Hex(text) => message_id(&text),
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
    } else {
        Some(cli.message_ids.iter().map(|id| message_id(id)).collect::<Result<Vec<_>>>()?)
    };
    if let Some(ids) = message_ids {
        filter = filter.with_message_ids(ids);
    }

    let row_cap = match (cli.row_cap, file.output.row_cap) {
        (Some(cap), _) => cap,
        (None, Some(setting)) => parse_row_cap(&setting)?,
        (None, None) => RowCapMode::default(),
    };

    let decoding = file.decoding;
    let mut job = JobConfig::new(input, output)
        .with_filter(filter)
        .with_row_cap(row_cap)
        .with_bit_expansion(cli.expand_bits.or(decoding.expand_bits).unwrap_or_default())
        .with_split_channels(!cli.combined && file.output.split_channels.unwrap_or(true))
        .with_split_on_cap(!cli.no_split_on_cap && file.output.split_on_cap.unwrap_or(true))
        .with_malformed_rows(if cli.abort_on_malformed {
            MalformedPolicy::Abort
        } else {
            decoding.malformed_rows.unwrap_or_default()
        })
        .with_fail_fast(!cli.keep_going && decoding.fail_fast.unwrap_or(true));

    if let Some(rows) = decoding.flush_rows {
        job = job.with_flush_rows(rows);
    }
    if let Some(interval) = decoding.progress_interval_ms {
        job = job.with_progress_interval_ms(interval);
    }
    if let Some(limit) = decoding.max_warnings {
        job = job.with_max_warnings(limit);
    }

    Ok(Settings { job, signals })
}

/// Load a signal table from a file or a `builtin:NAME` preset
pub fn load_signal_table(source: &str) -> Result<SignalTable> {
    let table = match source.strip_prefix("builtin:") {
        Some(name) => SignalTable::builtin(name)?,
        None => SignalTable::load(Path::new(source))
            .with_context(|| format!("Failed to load signal table: {}", source))?,
    };
    Ok(table)
}

/// `<input stem>_decoded.csv` next to the input
fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string());
    input.with_file_name(format!("{}_decoded.csv", stem))
}

fn message_id(text: &str) -> Result<u32> {
    can_csv_decoder::parse_hex_id(text).map_err(|reason| anyhow!(reason))
}

fn parse_row_cap(setting: &RowCapSetting) -> Result<RowCapMode> {
    match setting {
        RowCapSetting::Rows(rows) => Ok(RowCapMode::Custom(*rows)),
        RowCapSetting::Named(name) => match name.to_ascii_lowercase().as_str() {
            "modern" | "xlsx" => Ok(RowCapMode::Modern),
            "legacy" | "xls" => Ok(RowCapMode::Legacy),
            other => bail!("unknown row cap '{}' (expected modern, legacy or a number)", other),
        },
    }
}
