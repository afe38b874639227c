pub mod adapter;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod isolation;
pub mod model;
pub mod problem;
pub mod report;
pub mod solver;
pub mod watchdog;

pub use adapter::{AdapterLimits, AdapterReport, SolverAdapter};
pub use batch::{run_batch, run_with_config, BatchOptions, BatchSummary};
pub use catalog::{discover, Catalog, CatalogOptions, ListingOrder};
pub use config::BatchConfig;
pub use isolation::{serve_worker, IsolationBoundary, ProcessBoundary, ThreadBoundary};
pub use model::{Job, JobResult, JobStatus, SolveOutcome};
pub use problem::{parse_problem, read_problem_file, ProblemError, ProblemInstance};
pub use report::{read_report, ReportRow, ReportSink};
pub use solver::{BranchAndBound, Solver, SolverAnswer};
pub use watchdog::{Watchdog, WatchdogLimits};
