use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// One problem file selected for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub group: String,
    pub size_label: String,
    pub source_path: PathBuf,
    /// `source_path` relative to the discovery root, `/`-separated.
    pub relative_path: String,
    pub time_budget: Duration,
}

/// What the Solver Adapter hands back for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub objective_value: u64,
    pub selected_items: BTreeSet<usize>,
    pub total_weight: u64,
    pub is_optimal: bool,
    pub elapsed: Duration,
}

impl SolveOutcome {
    pub fn empty(elapsed: Duration) -> Self {
        Self {
            objective_value: 0,
            selected_items: BTreeSet::new(),
            total_weight: 0,
            is_optimal: false,
            elapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobStatus {
    Solved,
    SoftTimeout,
    HardTimeout,
    ParseError(String),
    SolverError(String),
    NoResult,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Solved => "solved",
            JobStatus::SoftTimeout => "soft_timeout",
            JobStatus::HardTimeout => "hard_timeout",
            JobStatus::ParseError(_) => "parse_error",
            JobStatus::SolverError(_) => "solver_error",
            JobStatus::NoResult => "no_result",
        }
    }

    /// Rows with these statuses carry a usable value and weight.
    pub fn has_solution(&self) -> bool {
        matches!(self, JobStatus::Solved | JobStatus::SoftTimeout)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::ParseError(msg) | JobStatus::SolverError(msg) => {
                write!(f, "{}: {}", self.label(), flatten(msg))
            }
            _ => f.write_str(self.label()),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (label, detail) = match s.split_once(':') {
            Some((label, detail)) => (label.trim(), detail.trim().to_string()),
            None => (s.trim(), String::new()),
        };
        match label {
            "solved" => Ok(JobStatus::Solved),
            "soft_timeout" => Ok(JobStatus::SoftTimeout),
            "hard_timeout" => Ok(JobStatus::HardTimeout),
            "no_result" => Ok(JobStatus::NoResult),
            "parse_error" => Ok(JobStatus::ParseError(detail)),
            "solver_error" => Ok(JobStatus::SolverError(detail)),
            other => Err(anyhow!("unknown job status: {}", other)),
        }
    }
}

fn flatten(msg: &str) -> String {
    msg.split(['\r', '\n'])
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The single durable record produced for every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub group: String,
    pub size_label: String,
    pub relative_path: String,
    pub objective_value: u64,
    pub total_weight: u64,
    pub is_optimal: bool,
    pub elapsed: Duration,
    pub status: JobStatus,
}

impl JobResult {
    pub fn from_outcome(job: &Job, outcome: &SolveOutcome, status: JobStatus) -> Self {
        if !status.has_solution() {
            return Self::failed(job, status, Duration::ZERO);
        }
        Self {
            group: job.group.clone(),
            size_label: job.size_label.clone(),
            relative_path: job.relative_path.clone(),
            objective_value: outcome.objective_value,
            total_weight: outcome.total_weight,
            is_optimal: outcome.is_optimal,
            elapsed: outcome.elapsed,
            status,
        }
    }

    /// A result with zeroed value and weight. `elapsed` is zero for every
    /// status except `HardTimeout`, which records the budget.
    pub fn failed(job: &Job, status: JobStatus, elapsed: Duration) -> Self {
        Self {
            group: job.group.clone(),
            size_label: job.size_label.clone(),
            relative_path: job.relative_path.clone(),
            objective_value: 0,
            total_weight: 0,
            is_optimal: false,
            elapsed,
            status,
        }
    }
}
