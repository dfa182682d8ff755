//! End-to-end decode jobs over small captures

use can_csv_decoder::{
    BitExpansion, Channel, ChannelFilter, DecoderError, Job, JobConfig, JobOutcome, JobReport,
    JobState, JobWarning, MalformedPolicy, RowCapMode, SignalTable,
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SPEED_TABLE: &str = "\
channel,message_id,name,start_bit,bit_length,byte_order,signed,scale,offset,unit,kind
any,0x100,Speed,0,8,little,false,0.5,0,km/h,scaled
";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn speed_table() -> Arc<SignalTable> {
    Arc::new(SignalTable::from_csv_reader(SPEED_TABLE.as_bytes()).unwrap())
}

fn write_capture(dir: &Path, rows: &str) -> PathBuf {
    let path = dir.join("capture.csv");
    std::fs::write(&path, format!("timestamp,channel,id,data\n{}", rows)).unwrap();
    path
}

/// Header and data rows of an output file
fn read_output(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}

fn completed(outcome: JobOutcome) -> JobReport {
    match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected a completed job, got {:?}", other),
    }
}

#[test]
fn test_three_row_capture() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let input = write_capture(
        dir.path(),
        "0.000,can0,100,64\n0.100,can0,200,01\n0.200,can1,100,14\n",
    );
    let config = JobConfig::new(input, dir.path().join("out.csv"));

    let report = completed(Job::run(config, speed_table()));
    assert!(report.warnings.is_empty());
    assert_eq!(report.rows_written(), 2);
    assert_eq!(
        report.outputs,
        vec![dir.path().join("out_can0.csv"), dir.path().join("out_can1.csv")]
    );

    let (header, can0) = read_output(&dir.path().join("out_can0.csv"));
    assert_eq!(header, vec!["timestamp", "channel", "Speed"]);
    assert_eq!(can0, vec![vec!["0", "CAN0", "50"]]);

    let (_, can1) = read_output(&dir.path().join("out_can1.csv"));
    assert_eq!(can1, vec![vec!["0.2", "CAN1", "10"]]);
}

#[test]
fn test_row_cap_rolls_over_into_parts() {
    let dir = TempDir::new().unwrap();
    let mut rows = String::new();
    for i in 0..5 {
        writeln!(rows, "{}.0,can0,100,{:02X}", i, i * 2).unwrap();
    }
    let input = write_capture(dir.path(), &rows);
    let config = JobConfig::new(input, dir.path().join("trip.csv"))
        .with_filter(ChannelFilter::new().with_channels(vec![Channel::Can0]))
        .with_row_cap(RowCapMode::Custom(2));

    let report = completed(Job::run(config, speed_table()));
    let expected = vec![
        dir.path().join("trip_can0.csv"),
        dir.path().join("trip_can0_part002.csv"),
        dir.path().join("trip_can0_part003.csv"),
    ];
    assert_eq!(report.outputs, expected);

    let parts: Vec<_> = expected.iter().map(|p| read_output(p)).collect();
    assert_eq!(
        parts.iter().map(|(_, rows)| rows.len()).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
    assert!(parts.iter().all(|(header, _)| header == &parts[0].0));
    assert!(!dir.path().join("trip_can1.csv").exists());
}

#[test]
fn test_split_output_concatenates_to_unsplit_output() {
    let dir = TempDir::new().unwrap();
    let mut rows = String::new();
    for i in 0..23 {
        let channel = if i % 3 == 0 { "can1" } else { "can0" };
        writeln!(rows, "{}.5,{},100,{:02X}", i, channel, i).unwrap();
    }
    let input = write_capture(dir.path(), &rows);

    let whole = completed(Job::run(
        JobConfig::new(&input, dir.path().join("whole.csv")).with_split_channels(false),
        speed_table(),
    ));
    let split = completed(Job::run(
        JobConfig::new(&input, dir.path().join("split.csv"))
            .with_split_channels(false)
            .with_row_cap(RowCapMode::Custom(4))
            .with_flush_rows(3),
        speed_table(),
    ));

    assert_eq!(whole.outputs.len(), 1);
    assert_eq!(split.outputs.len(), 6);

    let (_, expected) = read_output(&whole.outputs[0]);
    let concatenated: Vec<Vec<String>> = split
        .outputs
        .iter()
        .flat_map(|p| read_output(p).1)
        .collect();
    assert_eq!(expected.len(), 23);
    assert_eq!(concatenated, expected);
}

#[test]
fn test_combined_output_is_time_ordered() {
    let dir = TempDir::new().unwrap();
    let input = write_capture(
        dir.path(),
        "\
1.0,can1,100,01
1.0,can0,100,02
0.5,can0,100,03
2.0,can1,100,04
1.5,can0,100,05
2.0,can0,100,06
",
    );
    let config = JobConfig::new(input, dir.path().join("all.csv")).with_split_channels(false);

    let report = completed(Job::run(config, speed_table()));
    assert_eq!(report.outputs, vec![dir.path().join("all.csv")]);

    let (header, rows) = read_output(&report.outputs[0]);
    assert_eq!(header, vec!["timestamp", "channel", "Speed"]);
    let order: Vec<(&str, &str)> = rows.iter().map(|r| (r[0].as_str(), r[1].as_str())).collect();
    // CAN0's own order (1.0, 0.5, ...) is preserved; ties go to CAN0
    assert_eq!(
        order,
        vec![
            ("1", "CAN0"),
            ("0.5", "CAN0"),
            ("1", "CAN1"),
            ("1.5", "CAN0"),
            ("2", "CAN0"),
            ("2", "CAN1"),
        ]
    );

    // No spool files are left next to the output
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".spool"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_cancellation_keeps_a_clean_prefix() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let total = 500_000u32;
    let mut rows = String::with_capacity(10_000_000);
    for i in 0..total {
        writeln!(rows, "{},can0,100,{:02X}", i, i % 256).unwrap();
    }
    let input = write_capture(dir.path(), &rows);
    let config = JobConfig::new(input, dir.path().join("cut.csv"))
        .with_filter(ChannelFilter::new().with_channels(vec![Channel::Can0]))
        .with_flush_rows(100)
        .with_progress_interval_ms(1);

    let handle = Job::start(config, speed_table());
    let updates = handle.progress_updates();
    let seen = updates
        .iter()
        .find(|snapshot| snapshot.state == JobState::Running && snapshot.rows_written() > 0);
    assert!(seen.is_some(), "job ended before any row was written");
    handle.cancel();

    let report = match handle.result() {
        JobOutcome::Cancelled(report) => report,
        other => panic!("expected a cancelled job, got {:?}", other),
    };

    assert!(report.rows_written() > 0);
    assert!(report.rows_written() < total as u64);
    assert!(!report.outputs.is_empty());

    let mut next = 0usize;
    for path in &report.outputs {
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.ends_with('\n'), "{:?} ends mid-row", path);

        let (header, rows) = read_output(path);
        assert_eq!(header, vec!["timestamp", "channel", "Speed"]);
        for row in &rows {
            assert_eq!(row.len(), 3);
            assert_eq!(row[0], next.to_string());
            assert_eq!(row[1], "CAN0");
            let expected = (next % 256) as f64 * 0.5;
            assert_eq!(row[2].parse::<f64>().unwrap(), expected);
            next += 1;
        }
    }
    assert_eq!(next as u64, report.rows_written());
}

#[test]
fn test_fully_truncated_frame_keeps_its_row() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let table = "\
channel,message_id,name,start_bit,bit_length
can0,0x100,Speed,8,8
";
    let input = write_capture(dir.path(), "0.1,can0,100,0010\n0.2,can0,100,00\n");
    let config = JobConfig::new(input, dir.path().join("o.csv"))
        .with_filter(ChannelFilter::new().with_channels(vec![Channel::Can0]));

    let table = Arc::new(SignalTable::from_csv_reader(table.as_bytes()).unwrap());
    let report = completed(Job::run(config, table));
    assert_eq!(report.rows_written(), 2);
    assert!(matches!(
        report.warnings.as_slice(),
        [JobWarning::TruncatedSignal { line: 3, signal, required: 2, available: 1, .. }] if signal == "Speed"
    ));

    let (_, rows) = read_output(&dir.path().join("o_can0.csv"));
    assert_eq!(rows, vec![vec!["0.1", "CAN0", "16"], vec!["0.2", "CAN0", ""]]);
}

#[test]
fn test_output_over_the_input_is_rejected() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let input = write_capture(dir.path(), "0.1,can0,100,10\n0.2,can0,100,20\n");
    let original = std::fs::read_to_string(&input).unwrap();

    let single = JobConfig::new(&input, &input)
        .with_split_channels(false)
        .with_filter(ChannelFilter::new().with_channels(vec![Channel::Can0]))
        .with_flush_rows(1);
    assert!(matches!(
        Job::run(single, speed_table()),
        JobOutcome::Failed { error: DecoderError::Configuration(_), .. }
    ));

    // Per-channel output whose CAN0 file is the capture itself
    let renamed = dir.path().join("capture_can0.csv");
    std::fs::rename(&input, &renamed).unwrap();
    let per_channel = JobConfig::new(&renamed, dir.path().join("capture.csv"));
    assert!(matches!(
        Job::run(per_channel, speed_table()),
        JobOutcome::Failed { error: DecoderError::Configuration(_), .. }
    ));

    assert_eq!(std::fs::read_to_string(&renamed).unwrap(), original);
}

#[test]
fn test_malformed_rows_are_skipped_with_warnings() {
    let dir = TempDir::new().unwrap();
    let input = write_capture(
        dir.path(),
        "0.1,can0,100,10\n0.2,can0,100,ZZ\n0.3,can0,100,20\n",
    );
    let config = JobConfig::new(input, dir.path().join("out.csv"));

    let report = completed(Job::run(config, speed_table()));
    assert_eq!(report.rows_written(), 2);
    assert!(matches!(
        report.warnings.as_slice(),
        [JobWarning::MalformedRow { line: 3, .. }]
    ));
}

#[test]
fn test_malformed_row_aborts_and_removes_outputs() {
    let dir = TempDir::new().unwrap();
    let input = write_capture(
        dir.path(),
        "0.1,can0,100,10\n0.2,can0,100,ZZ\n0.3,can0,100,20\n",
    );
    let config = JobConfig::new(input, dir.path().join("out.csv"))
        .with_malformed_rows(MalformedPolicy::Abort)
        .with_flush_rows(1);

    match Job::run(config, speed_table()) {
        JobOutcome::Failed {
            error: DecoderError::MalformedInput { line, .. },
            ..
        } => assert_eq!(line, 3),
        other => panic!("expected a failed job, got {:?}", other),
    }
    assert!(!dir.path().join("out_can0.csv").exists());
    assert!(!dir.path().join("out_can1.csv").exists());
}

#[test]
fn test_keep_going_records_pipeline_failure() {
    let dir = TempDir::new().unwrap();
    // The bad payload is on CAN1 only, so only that pipeline fails
    let input = write_capture(
        dir.path(),
        "0.1,can0,100,10\n0.2,can1,100,ZZ\n0.3,can0,100,20\n",
    );
    let config = JobConfig::new(input, dir.path().join("out.csv"))
        .with_malformed_rows(MalformedPolicy::Abort)
        .with_fail_fast(false);

    let report = completed(Job::run(config, speed_table()));
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, JobWarning::PipelineFailed { channel: Channel::Can1, .. })));
    let (_, can0) = read_output(&dir.path().join("out_can0.csv"));
    assert_eq!(can0.len(), 2);

    let can1 = report.channels.iter().find(|c| c.channel == Channel::Can1).unwrap();
    assert!(can1.error.is_some());
}

#[test]
fn test_bit_expansion_columns() {
    let dir = TempDir::new().unwrap();
    let table = "\
channel,message_id,name,start_bit,bit_length,kind
can0,0x200,Status,0,3,bitfield
can0,0x200,Mode,8,8,scaled
";
    let input = write_capture(dir.path(), "0.1,can0,200,05 07\n");
    let config = JobConfig::new(input, dir.path().join("bits.csv"))
        .with_filter(ChannelFilter::new().with_channels(vec![Channel::Can0]))
        .with_bit_expansion(BitExpansion::Append);

    let table = Arc::new(SignalTable::from_csv_reader(table.as_bytes()).unwrap());
    completed(Job::run(config, table));

    let (header, rows) = read_output(&dir.path().join("bits_can0.csv"));
    assert_eq!(
        header,
        vec!["timestamp", "channel", "Status", "Status[0]", "Status[1]", "Status[2]", "Mode"]
    );
    assert_eq!(rows, vec![vec!["0.1", "CAN0", "5", "1", "0", "1", "7"]]);
}

#[test]
fn test_builtin_preset_decodes_big_endian_cells() {
    let dir = TempDir::new().unwrap();
    // cell 5 at 3.6 V, not shunting, 1.25 mOhm, OCV 3.7 V, checksum 0xAA
    let input = write_capture(dir.path(), "0.5,can1,6B4,05 8C A0 00 7D 90 88 AA\n");
    let config = JobConfig::new(input, dir.path().join("bms.csv"))
        .with_filter(ChannelFilter::new().with_channels(vec![Channel::Can1]));

    let table = Arc::new(SignalTable::builtin("wavesculptor-orion").unwrap());
    completed(Job::run(config, table));

    let (header, rows) = read_output(&dir.path().join("bms_can1.csv"));
    let cell = |name: &str| {
        let i = header.iter().position(|h| h == name).unwrap();
        rows[0][i].clone()
    };
    assert_eq!(cell("cell_id"), "5");
    assert!((cell("inst_voltage_V").parse::<f64>().unwrap() - 3.6).abs() < 1e-9);
    assert_eq!(cell("shunting"), "0");
    assert!((cell("internal_resistance_mOhm").parse::<f64>().unwrap() - 1.25).abs() < 1e-9);
    assert!((cell("open_circuit_voltage_V").parse::<f64>().unwrap() - 3.7).abs() < 1e-9);
    assert_eq!(cell("checksum"), "170");
    // CAN0-only columns never appear in a CAN1 file
    assert!(!header.iter().any(|h| h == "bus_voltage_V"));
}
