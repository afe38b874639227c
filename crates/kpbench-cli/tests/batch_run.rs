use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Command;

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, body).expect("write");
}

fn kpbench() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kpbench"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn fixture(root: &Path) {
    write(root, "00Uncorrelated/n00050/R01000/s000.kp", "50\n60 10\n100 20\n120 30\n");
    write(root, "00Uncorrelated/n00100/R01000/s000.kp", "10\n");
    write(root, "01Weakly/n00050/R01000/s000.kp", "ten\n1 1\n");
}

#[test]
fn run_writes_one_row_per_job_through_worker_processes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("kplib");
    fixture(&root);
    let report = dir.path().join("results.csv");

    let out = kpbench()
        .args(["run", "--time-limit", "30", "--json"])
        .arg("--root")
        .arg(&root)
        .arg("--report")
        .arg(&report)
        .output()
        .expect("spawn kpbench");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json output");
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["summary"]["executed"], 3);
    assert_eq!(payload["summary"]["by_status"]["solved"], 2);
    assert_eq!(payload["summary"]["by_status"]["parse_error"], 1);

    let text = fs::read_to_string(&report).expect("report");
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "Group,Size,File,Value,Weight,Optimal,Time(s),Status");
    assert!(lines[1].starts_with("00Uncorrelated,n00050,00Uncorrelated/n00050/R01000/s000.kp,220,50,True,"));
    assert!(lines[1].ends_with(",solved"));
    assert!(lines[2].starts_with("00Uncorrelated,n00100,00Uncorrelated/n00100/R01000/s000.kp,0,0,True,"));
    assert!(lines[3].starts_with("01Weakly,n00050,01Weakly/n00050/R01000/s000.kp,0,0,False,0.00,"));
    assert!(lines[3].contains("parse_error"));
}

#[test]
fn resume_skips_reported_jobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("kplib");
    fixture(&root);
    let report = dir.path().join("results.csv");
    let run = |extra: &[&str]| {
        let out = kpbench()
            .args(["run", "--time-limit", "30", "--workers", "2"])
            .args(extra)
            .arg("--root")
            .arg(&root)
            .arg("--report")
            .arg(&report)
            .output()
            .expect("spawn kpbench");
        assert!(out.status.success());
        String::from_utf8_lossy(&out.stdout).to_string()
    };
    run(&[]);
    let second = run(&["--resume"]);
    assert!(second.contains("skipped: 3"), "{second}");
    assert!(second.contains("executed: 0"), "{second}");
    assert_eq!(fs::read_to_string(&report).expect("report").lines().count(), 4);
}

#[test]
fn dry_run_lists_catalog_without_writing_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("kplib");
    fixture(&root);
    let report = dir.path().join("results.csv");
    let out = kpbench()
        .args(["run", "--dry-run"])
        .arg("--root")
        .arg(&root)
        .arg("--report")
        .arg(&report)
        .output()
        .expect("spawn kpbench");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("jobs: 3"), "{stdout}");
    assert!(!report.exists());
}

#[test]
fn empty_root_is_nothing_to_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = dir.path().join("results.csv");
    let out = kpbench()
        .args(["run"])
        .arg("--root")
        .arg(dir.path().join("absent"))
        .arg("--report")
        .arg(&report)
        .output()
        .expect("spawn kpbench");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("nothing to run"));
    assert_eq!(
        fs::read_to_string(&report).expect("report").trim_end(),
        "Group,Size,File,Value,Weight,Optimal,Time(s),Status"
    );
}

#[test]
fn invalid_flags_fail_with_json_error() {
    let out = kpbench()
        .args(["run", "--workers", "0", "--json"])
        .output()
        .expect("spawn kpbench");
    assert!(!out.status.success());
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json output");
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["error"]["code"], "command_failed");
}

#[test]
fn oversized_time_limit_is_rejected_before_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("kplib");
    fixture(&root);
    let report = dir.path().join("results.csv");
    let out = kpbench()
        .args(["run", "--time-limit", "18446744073709551615", "--json"])
        .arg("--root")
        .arg(&root)
        .arg("--report")
        .arg(&report)
        .output()
        .expect("spawn kpbench");
    assert!(!out.status.success());
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json output");
    assert_eq!(payload["ok"], false);
    assert!(payload["error"]["message"]
        .as_str()
        .expect("message")
        .contains("time_limit_secs"));
    assert!(!report.exists());
}
