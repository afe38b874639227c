//! Incrementally written CSV report, one row per job.
//!
//! Every row is a single `write_all` followed by a flush and `sync_data`, so
//! an interrupted batch leaves a readable, truncated report.

use crate::model::{JobResult, JobStatus};
use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const HEADER: [&str; 8] = [
    "Group", "Size", "File", "Value", "Weight", "Optimal", "Time(s)", "Status",
];

/// A report row as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub group: String,
    pub size: String,
    pub file: String,
    pub value: u64,
    pub weight: u64,
    pub optimal: bool,
    pub time_secs: f64,
    pub status: JobStatus,
}

/// Single writer for the report file.
#[derive(Debug)]
pub struct ReportSink {
    path: PathBuf,
    file: File,
    rows: usize,
}

impl ReportSink {
    /// Truncates `path` and writes the header.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating report directory {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("creating report {}", path.display()))?;
        let mut sink = Self {
            path: path.to_path_buf(),
            file,
            rows: 0,
        };
        sink.write_line(&join_row(HEADER.iter().map(|h| h.to_string())))?;
        Ok(sink)
    }

    /// Reopens an existing report for appending and returns the rows already
    /// in it. Falls back to [`ReportSink::create`] when there is nothing to
    /// resume.
    pub fn resume(path: &Path) -> Result<(Self, Vec<ReportRow>)> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Self::create(path)?, Vec::new()));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading report {}", path.display()))
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok((Self::create(path)?, Vec::new()));
        }
        // Everything after the last newline is a row torn by an earlier crash.
        let kept = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None => {
                let partial = String::from_utf8_lossy(&bytes);
                if HEADER.join(",").starts_with(partial.trim_end()) {
                    return Ok((Self::create(path)?, Vec::new()));
                }
                bytes.len()
            }
        };
        let text = std::str::from_utf8(&bytes[..kept])
            .with_context(|| format!("report {} is not UTF-8", path.display()))?;
        let rows = parse_report(text, true)?;
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("opening report {}", path.display()))?;
        if kept < bytes.len() {
            warn!(
                target: "kpbench::report",
                path = %path.display(),
                dropped = %String::from_utf8_lossy(&bytes[kept..]).trim_end(),
                "discarding torn final row"
            );
            file.set_len(kept as u64)
                .with_context(|| format!("truncating report {}", path.display()))?;
            file.sync_data()?;
        }
        debug!(target: "kpbench::report", path = %path.display(), rows = rows.len(), "resuming report");
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                rows: rows.len(),
            },
            rows,
        ))
    }

    pub fn append(&mut self, result: &JobResult) -> Result<()> {
        self.write_line(&format_row(result))?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows in the file, including rows present before a resume.
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.file
            .write_all(buf.as_bytes())
            .with_context(|| format!("appending to report {}", self.path.display()))?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

pub fn format_row(result: &JobResult) -> String {
    join_row([
        result.group.clone(),
        result.size_label.clone(),
        result.relative_path.clone(),
        result.objective_value.to_string(),
        result.total_weight.to_string(),
        if result.is_optimal { "True" } else { "False" }.to_string(),
        format!("{:.2}", result.elapsed.as_secs_f64()),
        result.status.to_string(),
    ])
}

pub fn read_report(path: &Path) -> Result<Vec<ReportRow>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading report {}", path.display()))?;
    parse_report(&text, false)
}

/// With `lenient`, malformed data rows are skipped instead of rejected.
fn parse_report(text: &str, lenient: bool) -> Result<Vec<ReportRow>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| anyhow!("report is empty"))?;
    if split_row(header)? != HEADER {
        return Err(anyhow!("unexpected report header: {}", header));
    }
    let mut rows = Vec::new();
    for (idx, line) in lines.enumerate() {
        match split_row(line).and_then(|fields| parse_fields(&fields)) {
            Ok(row) => rows.push(row),
            Err(e) if lenient => {
                warn!(target: "kpbench::report", row = idx + 1, error = %e, "skipping malformed report row");
            }
            Err(e) => return Err(e.context(format!("report row {}", idx + 1))),
        }
    }
    Ok(rows)
}

fn parse_fields(fields: &[String]) -> Result<ReportRow> {
    let [group, size, file, value, weight, optimal, time, status] = fields else {
        return Err(anyhow!("expected {} fields, found {}", HEADER.len(), fields.len()));
    };
    Ok(ReportRow {
        group: group.clone(),
        size: size.clone(),
        file: file.clone(),
        value: value.parse().with_context(|| format!("bad value {value:?}"))?,
        weight: weight.parse().with_context(|| format!("bad weight {weight:?}"))?,
        optimal: match optimal.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            other => return Err(anyhow!("bad optimal flag {:?}", other)),
        },
        time_secs: time.parse().with_context(|| format!("bad time {time:?}"))?,
        status: status.parse()?,
    })
}

fn join_row<I: IntoIterator<Item = String>>(fields: I) -> String {
    fields
        .into_iter()
        .map(|f| quote_field(&f))
        .collect::<Vec<_>>()
        .join(",")
}

fn quote_field(field: &str) -> String {
    let flat = field.replace(['\r', '\n'], " ");
    if flat.contains([',', '"']) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

fn split_row(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            ('"', true) => quoted = false,
            ('"', false) if current.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(anyhow!("unterminated quoted field"));
    }
    fields.push(current);
    Ok(fields)
}
