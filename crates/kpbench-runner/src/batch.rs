//! Drives every catalogued job through the Watchdog and streams results to
//! the report in submission order.

use crate::catalog::{self, Catalog};
use crate::config::BatchConfig;
use crate::isolation::IsolationBoundary;
use crate::model::{Job, JobResult, JobStatus};
use crate::problem::read_problem_file;
use crate::report::ReportSink;
use crate::watchdog::Watchdog;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub report_path: PathBuf,
    /// Jobs in flight at once; results are still written in catalog order.
    pub workers: usize,
    /// Skip jobs whose file already appears in an existing report.
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report_path: PathBuf,
    pub discovered: usize,
    pub executed: usize,
    pub skipped: usize,
    pub by_status: BTreeMap<String, usize>,
    pub diagnostics: Vec<String>,
}

/// Discovers jobs under `cfg.root` and runs them in worker processes or
/// threads provided by `boundary`.
pub fn run_with_config<B: IsolationBoundary>(cfg: &BatchConfig, boundary: B) -> Result<BatchSummary> {
    cfg.validate()?;
    let catalog = catalog::discover(&cfg.root, &cfg.catalog_options());
    let watchdog = Watchdog::new(boundary, cfg.watchdog_limits(), cfg.adapter_limits());
    let opts = BatchOptions {
        report_path: cfg.report.clone(),
        workers: cfg.workers,
        resume: cfg.resume,
    };
    run_batch(catalog, &watchdog, &opts)
}

pub fn run_batch<B: IsolationBoundary>(
    catalog: Catalog,
    watchdog: &Watchdog<B>,
    opts: &BatchOptions,
) -> Result<BatchSummary> {
    let started_at = Utc::now();
    let run_id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S"));
    let diagnostics: Vec<String> = catalog
        .diagnostics
        .iter()
        .map(|d| format!("{}: {}", d.path.display(), d.message))
        .collect();
    let discovered = catalog.job_count();

    // Opening the report is the one failure that ends the run.
    let (mut sink, done) = if opts.resume {
        let (sink, rows) = ReportSink::resume(&opts.report_path)?;
        let done: HashSet<String> = rows.into_iter().map(|r| r.file).collect();
        (sink, done)
    } else {
        (ReportSink::create(&opts.report_path)?, HashSet::new())
    };

    let jobs: Vec<Job> = catalog
        .into_jobs()
        .into_iter()
        .filter(|job| !done.contains(&job.relative_path))
        .collect();
    let skipped = discovered - jobs.len();
    if discovered == 0 {
        warn!(target: "kpbench::batch", report = %opts.report_path.display(), "catalog is empty; nothing to run");
    } else {
        info!(target: "kpbench::batch", %run_id, discovered, skipped, workers = opts.workers, "batch started");
    }

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    let mut executed = 0usize;
    let mut record = |result: JobResult| -> Result<()> {
        log_result(&result);
        sink.append(&result)?;
        *by_status.entry(result.status.label().to_string()).or_default() += 1;
        executed += 1;
        Ok(())
    };

    if opts.workers <= 1 || jobs.len() <= 1 {
        for job in &jobs {
            record(execute_job(watchdog, job))?;
        }
    } else {
        run_pool(&jobs, watchdog, opts.workers, &mut record)?;
    }

    let summary = BatchSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        report_path: opts.report_path.clone(),
        discovered,
        executed,
        skipped,
        by_status,
        diagnostics,
    };
    info!(
        target: "kpbench::batch",
        run_id = %summary.run_id,
        executed = summary.executed,
        skipped = summary.skipped,
        report = %summary.report_path.display(),
        "batch finished"
    );
    Ok(summary)
}

/// Parses the job's file and supervises its solve; never fails.
fn execute_job<B: IsolationBoundary>(watchdog: &Watchdog<B>, job: &Job) -> JobResult {
    match read_problem_file(&job.source_path) {
        Ok(instance) => watchdog.supervise(job, instance),
        Err(e) => {
            warn!(target: "kpbench::batch", job = %job.relative_path, error = %e, "problem file rejected");
            JobResult::failed(job, JobStatus::ParseError(e.to_string()), Duration::ZERO)
        }
    }
}

/// Bounded pool: `workers` jobs in flight, results released to `record`
/// strictly in submission order.
fn run_pool<B, F>(jobs: &[Job], watchdog: &Watchdog<B>, workers: usize, record: &mut F) -> Result<()>
where
    B: IsolationBoundary,
    F: FnMut(JobResult) -> Result<()>,
{
    let next = AtomicUsize::new(0);
    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, JobResult)>();
        for _ in 0..workers.min(jobs.len()) {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(idx) else {
                    break;
                };
                if tx.send((idx, execute_job(watchdog, job))).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        let mut pending = BTreeMap::new();
        let mut emit = 0usize;
        for (idx, result) in rx {
            pending.insert(idx, result);
            while let Some(result) = pending.remove(&emit) {
                if let Err(e) = record(result) {
                    // Stop handing out work; in-flight jobs finish and are dropped.
                    next.store(jobs.len(), Ordering::SeqCst);
                    return Err(e);
                }
                emit += 1;
            }
        }
        Ok(())
    })
}

fn log_result(result: &JobResult) {
    info!(
        target: "kpbench::batch",
        group = %result.group,
        size = %result.size_label,
        value = result.objective_value,
        weight = result.total_weight,
        optimal = result.is_optimal,
        time = %format!("{:.2}s", result.elapsed.as_secs_f64()),
        status = %result.status,
        "job finished"
    );
}
