use anyhow::Result;
use clap::{Parser, Subcommand};
use kpbench_runner::{BatchConfig, BatchSummary, BranchAndBound, Catalog, ProcessBoundary};
use serde_json::{json, Value};
use std::io;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kpbench", version, about = "Time-bounded knapsack batch runner")]
struct Cli {
    /// Log filter, e.g. `debug` or `kpbench::watchdog=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve every catalogued instance and write the CSV report.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
        /// Smallest size directories taken per group.
        #[arg(long)]
        sizes: Option<usize>,
        /// Per-instance time budget in seconds.
        #[arg(long)]
        time_limit: Option<u64>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        resume: bool,
        /// List the jobs that would run and exit.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Solve one request read from stdin; spawned by `run`.
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let json_mode = matches!(cli.command, Commands::Run { json: true, .. });
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // stdout belongs to the worker reply and to --json output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Worker => {
            kpbench_runner::serve_worker(io::stdin().lock(), io::stdout().lock(), BranchAndBound)?;
        }
        Commands::Run {
            config,
            root,
            report,
            sizes,
            time_limit,
            workers,
            resume,
            dry_run,
            json,
        } => {
            let mut cfg = match &config {
                Some(path) => BatchConfig::load(path)?,
                None => BatchConfig::default(),
            };
            if let Some(root) = root {
                cfg.root = root;
            }
            if let Some(report) = report {
                cfg.report = report;
            }
            if let Some(sizes) = sizes {
                cfg.sizes_per_group = sizes;
            }
            if let Some(secs) = time_limit {
                cfg.time_limit_secs = secs;
            }
            if let Some(workers) = workers {
                cfg.workers = workers;
            }
            cfg.resume |= resume;
            cfg.validate()?;
            debug!(target: "kpbench::cli", config = ?cfg, "effective configuration");

            if dry_run {
                let catalog = kpbench_runner::discover(&cfg.root, &cfg.catalog_options());
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run",
                        "dry_run": true,
                        "catalog": catalog_to_json(&catalog)
                    })));
                }
                print_catalog(&catalog);
                return Ok(None);
            }

            let summary = kpbench_runner::run_with_config(&cfg, ProcessBoundary::current_exe()?)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary
                })));
            }
            print_summary(&summary);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn catalog_to_json(catalog: &Catalog) -> Value {
    json!({
        "jobs": catalog.jobs().map(|j| json!({
            "group": j.group,
            "size": j.size_label,
            "file": j.relative_path,
            "time_budget_secs": j.time_budget.as_secs()
        })).collect::<Vec<_>>(),
        "diagnostics": catalog.diagnostics.iter().map(|d| json!({
            "path": d.path.display().to_string(),
            "message": d.message
        })).collect::<Vec<_>>()
    })
}

fn print_catalog(catalog: &Catalog) {
    for group in &catalog.groups {
        println!("group: {}", group.name);
        for job in &group.jobs {
            println!("  {}: {}", job.size_label, job.relative_path);
        }
    }
    println!("jobs: {}", catalog.job_count());
    for d in &catalog.diagnostics {
        println!("diagnostic: {}: {}", d.path.display(), d.message);
    }
}

fn print_summary(summary: &BatchSummary) {
    println!("run_id: {}", summary.run_id);
    if summary.discovered == 0 {
        println!("nothing to run");
    }
    println!("jobs: {}", summary.discovered);
    println!("executed: {}", summary.executed);
    println!("skipped: {}", summary.skipped);
    for (status, count) in &summary.by_status {
        println!("{}: {}", status, count);
    }
    println!("report: {}", summary.report_path.display());
}
