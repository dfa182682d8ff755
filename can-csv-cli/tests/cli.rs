//! Runs the built binary against small captures

use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_can-csv-cli"))
}

fn write(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_decode_with_toml_config_and_flag_override() {
    let dir = TempDir::new().unwrap();
    let capture = write(
        dir.path(),
        "capture.csv",
        "timestamp,channel,id,data\n0.0,can0,100,64\n0.1,can1,100,14\n",
    );
    let signals = write(
        dir.path(),
        "signals.json",
        r#"[{ "message_id": "0x100", "name": "Speed", "start_bit": 0, "bit_length": 8, "scale": 0.5 }]"#,
    );
    let config = write(
        dir.path(),
        "job.toml",
        &format!(
            "[input]\nfile = {:?}\nsignals = {:?}\n\n[output]\npath = {:?}\n",
            capture,
            signals,
            dir.path().join("from_file.csv")
        ),
    );
    let output = dir.path().join("from_flag.csv");
    let report = dir.path().join("report.json");

    let status = cli()
        .arg("--config")
        .arg(&config)
        .arg("--output")
        .arg(&output)
        .arg("--combined")
        .arg("--report")
        .arg(&report)
        .arg("-q")
        .status()
        .unwrap();
    assert!(status.success());

    let decoded = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = decoded.lines().collect();
    assert_eq!(lines, vec!["timestamp,channel,Speed", "0,CAN0,50", "0.1,CAN1,10"]);
    assert!(!dir.path().join("from_file.csv").exists());

    let json = std::fs::read_to_string(&report).unwrap();
    assert!(json.contains("\"rows_written\": 1"));
}

#[test]
fn test_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    let status = cli()
        .arg("--input")
        .arg(dir.path().join("nope.csv"))
        .arg("--signals")
        .arg("builtin:wavesculptor-orion")
        .arg("-q")
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn test_list_presets() {
    let output = cli().arg("--list-presets").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("builtin:wavesculptor-orion"));
}
