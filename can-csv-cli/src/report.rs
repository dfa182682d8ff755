//! Text summary of a finished job

use can_csv_decoder::{JobReport, JobWarning};
use std::fmt::Write;

/// Warnings printed in the summary; the rest are only counted
const SHOWN_WARNINGS: usize = 20;

/// Render a job report as plain text
pub fn render_summary(title: &str, report: &JobReport) -> String {
    let mut out = String::new();
    let rule = "═══════════════════════════════════════════════";

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "  {}", title);
    let _ = writeln!(out, "{}", rule);

    let seconds = report.duration().num_milliseconds() as f64 / 1000.0;
    let _ = writeln!(
        out,
        "Started:  {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "Duration: {:.2}s\n", seconds);

    let _ = writeln!(
        out,
        "{:<8} {:>12} {:>12} {:>12} {:>9}",
        "Channel", "Read", "Decoded", "Written", "Warnings"
    );
    for channel in &report.channels {
        let _ = writeln!(
            out,
            "{:<8} {:>12} {:>12} {:>12} {:>9}",
            channel.channel.to_string(),
            channel.rows_read,
            channel.rows_decoded,
            channel.rows_written,
            channel.warnings
        );
        if let Some(error) = &channel.error {
            let _ = writeln!(out, "         error: {}", error);
        }
    }

    let _ = writeln!(out, "\nOutput files:");
    if report.outputs.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for path in &report.outputs {
        let _ = writeln!(out, "  {}", path.display());
    }

    render_warnings(&mut out, &report.warnings, report.warnings_suppressed);
    out
}

/// Append the warning section, if there is anything to show
pub fn render_warnings(out: &mut String, warnings: &[JobWarning], suppressed: u64) {
    let total = warnings.len() as u64 + suppressed;
    if total == 0 {
        return;
    }

    let _ = writeln!(out, "\nWarnings ({}):", total);
    for warning in warnings.iter().take(SHOWN_WARNINGS) {
        let _ = writeln!(out, "  - {}", warning);
    }
    let hidden = total - warnings.len().min(SHOWN_WARNINGS) as u64;
    if hidden > 0 {
        let _ = writeln!(out, "  ... and {} more", hidden);
    }
}
