use crate::adapter::AdapterLimits;
use crate::isolation::{IsolationBoundary, WorkerHandle, WorkerPoll, WorkerRequest};
use crate::model::{Job, JobResult, JobStatus};
use crate::problem::ProblemInstance;
use crate::solver::deadline_after;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    /// Added to the job budget to form the supervisory budget.
    pub grace_margin: Duration,
    /// Wait between the graceful stop request and the forced kill.
    pub kill_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchdogLimits {
    fn default() -> Self {
        Self {
            grace_margin: Duration::from_secs(15),
            kill_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WatchdogLimits {
    /// Longest a single job can hold the orchestrator.
    pub fn worst_case(&self, time_budget: Duration) -> Duration {
        time_budget
            .saturating_add(self.grace_margin)
            .saturating_add(self.kill_grace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Dispatched,
    Running,
    Completed,
    Overrun,
}

/// Supervises one worker per job against a hard wall-clock budget.
pub struct Watchdog<B> {
    boundary: B,
    limits: WatchdogLimits,
    adapter_limits: AdapterLimits,
}

impl<B: IsolationBoundary> Watchdog<B> {
    pub fn new(boundary: B, limits: WatchdogLimits, adapter_limits: AdapterLimits) -> Self {
        Self {
            boundary,
            limits,
            adapter_limits,
        }
    }

    /// Always returns exactly one result for `job`.
    pub fn supervise(&self, job: &Job, instance: ProblemInstance) -> JobResult {
        let started = Instant::now();
        let deadline = deadline_after(
            started,
            job.time_budget.saturating_add(self.limits.grace_margin),
        );
        let capacity = instance.capacity;
        let mut state = WatchState::Dispatched;
        debug!(target: "kpbench::watchdog", job = %job.relative_path, ?state, "state transition");

        let request = WorkerRequest {
            job: job.clone(),
            instance,
            limits: self.adapter_limits,
        };
        let mut handle = match self.boundary.launch(request) {
            Ok(handle) => handle,
            Err(e) => {
                error!(target: "kpbench::watchdog", job = %job.relative_path, error = %format!("{:#}", e), "worker failed to start");
                return JobResult::failed(job, JobStatus::NoResult, Duration::ZERO);
            }
        };
        state = WatchState::Running;
        debug!(target: "kpbench::watchdog", job = %job.relative_path, worker = %handle.describe(), ?state, "state transition");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state = WatchState::Overrun;
                debug!(target: "kpbench::watchdog", job = %job.relative_path, ?state, "state transition");
                self.stop(handle.as_mut(), job);
                return JobResult::failed(job, JobStatus::HardTimeout, job.time_budget);
            }
            match handle.poll(remaining.min(self.limits.poll_interval)) {
                WorkerPoll::Pending => continue,
                WorkerPoll::Lost(note) => {
                    warn!(target: "kpbench::watchdog", job = %job.relative_path, worker = %handle.describe(), %note, "worker lost");
                    return JobResult::failed(job, JobStatus::NoResult, Duration::ZERO);
                }
                WorkerPoll::Delivered(reply) => {
                    state = WatchState::Completed;
                    debug!(target: "kpbench::watchdog", job = %job.relative_path, ?state, "state transition");
                    if reply.relative_path != job.relative_path {
                        warn!(target: "kpbench::watchdog", expected = %job.relative_path, got = %reply.relative_path, "worker answered for a different job");
                        return JobResult::failed(job, JobStatus::NoResult, Duration::ZERO);
                    }
                    let report = reply.report;
                    if report.status.has_solution() && report.outcome.total_weight > capacity {
                        let msg = format!(
                            "reported weight {} exceeds capacity {}",
                            report.outcome.total_weight, capacity
                        );
                        return JobResult::failed(
                            job,
                            JobStatus::SolverError(msg),
                            Duration::ZERO,
                        );
                    }
                    return JobResult::from_outcome(job, &report.outcome, report.status);
                }
            }
        }
    }

    /// Graceful stop, short grace, then forced kill. Failures are logged and
    /// never propagate.
    fn stop(&self, handle: &mut dyn WorkerHandle, job: &Job) {
        let worker = handle.describe();
        warn!(
            target: "kpbench::watchdog",
            job = %job.relative_path,
            %worker,
            budget_ms = job.time_budget.as_millis() as u64,
            "supervisory budget exceeded; terminating worker"
        );
        if let Err(e) = handle.terminate() {
            warn!(target: "kpbench::watchdog", %worker, error = %e, "graceful termination failed");
        }
        let grace_deadline = deadline_after(Instant::now(), self.limits.kill_grace);
        while handle.is_alive() {
            let left = grace_deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(self.limits.poll_interval));
        }
        if handle.is_alive() {
            if let Err(e) = handle.force_kill() {
                error!(target: "kpbench::watchdog", %worker, error = %e, "force kill failed; abandoning worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_solvers::{Failing, Sleepy};
    use crate::isolation::ThreadBoundary;
    use crate::solver::BranchAndBound;
    use std::path::PathBuf;

    fn job(budget: Duration) -> Job {
        Job {
            group: "g".to_string(),
            size_label: "n3".to_string(),
            source_path: PathBuf::from("/kplib/g/n3/t/a.kp"),
            relative_path: "g/n3/t/a.kp".to_string(),
            time_budget: budget,
        }
    }

    fn instance() -> ProblemInstance {
        ProblemInstance {
            values: vec![60, 100, 120],
            weights: vec![10, 20, 30],
            capacity: 50,
        }
    }

    fn fast_limits() -> WatchdogLimits {
        WatchdogLimits {
            grace_margin: Duration::from_millis(200),
            kill_grace: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn adapter_limits() -> AdapterLimits {
        AdapterLimits {
            solver_margin: Duration::from_millis(100),
            soft_margin: Duration::from_millis(50),
        }
    }

    #[test]
    fn completed_worker_yields_solved_result() {
        let dog = Watchdog::new(ThreadBoundary::new(BranchAndBound), fast_limits(), adapter_limits());
        let result = dog.supervise(&job(Duration::from_secs(5)), instance());
        assert_eq!(result.status, JobStatus::Solved);
        assert_eq!(result.objective_value, 220);
        assert_eq!(result.total_weight, 50);
        assert!(result.is_optimal);
        assert_eq!(result.relative_path, "g/n3/t/a.kp");
    }

    #[test]
    fn solver_error_is_forwarded_with_zeroed_columns() {
        let dog = Watchdog::new(ThreadBoundary::new(Failing), fast_limits(), adapter_limits());
        let result = dog.supervise(&job(Duration::from_secs(5)), instance());
        assert!(matches!(result.status, JobStatus::SolverError(_)));
        assert_eq!((result.objective_value, result.total_weight), (0, 0));
        assert_eq!(result.elapsed, Duration::ZERO);
    }

    #[test]
    fn hung_thread_worker_is_abandoned_as_hard_timeout() {
        let limits = fast_limits();
        let budget = Duration::from_millis(200);
        let dog = Watchdog::new(
            ThreadBoundary::new(Sleepy(Duration::from_secs(3))),
            limits,
            adapter_limits(),
        );
        let started = Instant::now();
        let result = dog.supervise(&job(budget), instance());
        assert_eq!(result.status, JobStatus::HardTimeout);
        assert_eq!(result.elapsed, budget);
        assert!(!result.is_optimal);
        assert!(started.elapsed() < limits.worst_case(budget) + Duration::from_millis(500));
    }

    #[test]
    fn unbounded_budget_still_completes() {
        let dog = Watchdog::new(ThreadBoundary::new(BranchAndBound), fast_limits(), adapter_limits());
        let result = dog.supervise(&job(Duration::from_secs(u64::MAX)), instance());
        assert_eq!(result.status, JobStatus::Solved);
        assert_eq!(result.objective_value, 220);
        assert_eq!(
            WatchdogLimits::default().worst_case(Duration::MAX),
            Duration::MAX
        );
    }

    #[test]
    fn worst_case_adds_both_margins() {
        let limits = WatchdogLimits::default();
        assert_eq!(limits.worst_case(Duration::from_secs(180)), Duration::from_secs(200));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::isolation::ProcessBoundary;
        use anyhow::Result;
        use std::sync::Mutex;

        /// Remembers which workers it launched.
        struct Recording {
            inner: ProcessBoundary,
            launched: Mutex<Vec<String>>,
        }

        impl Recording {
            fn sh(script: &str) -> Self {
                Self {
                    inner: ProcessBoundary::new("sh", vec!["-c".to_string(), script.to_string()]),
                    launched: Mutex::new(Vec::new()),
                }
            }

            fn pids(&self) -> Vec<i32> {
                self.launched
                    .lock()
                    .expect("lock")
                    .iter()
                    .filter_map(|d| d.strip_prefix("process ")?.parse().ok())
                    .collect()
            }
        }

        impl IsolationBoundary for Recording {
            fn launch(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>> {
                let handle = self.inner.launch(request)?;
                self.launched.lock().expect("lock").push(handle.describe());
                Ok(handle)
            }
        }

        fn process_gone(pid: i32) -> bool {
            // SAFETY: signal 0 only checks that the process exists.
            unsafe { libc::kill(pid, 0) != 0 }
        }

        #[test]
        fn hung_process_is_killed_and_reaped() {
            let limits = fast_limits();
            let budget = Duration::from_millis(300);
            let boundary = Recording::sh("exec sleep 30");
            let dog = Watchdog::new(boundary, limits, adapter_limits());
            let started = Instant::now();
            let result = dog.supervise(&job(budget), instance());
            assert_eq!(result.status, JobStatus::HardTimeout);
            assert!(started.elapsed() < limits.worst_case(budget) + Duration::from_secs(1));
            let pids = dog.boundary.pids();
            assert_eq!(pids.len(), 1);
            assert!(process_gone(pids[0]));
        }

        #[test]
        fn term_ignoring_process_is_force_killed() {
            let limits = fast_limits();
            let budget = Duration::from_millis(300);
            let boundary = Recording::sh("trap '' TERM; while :; do sleep 1; done");
            let dog = Watchdog::new(boundary, limits, adapter_limits());
            let started = Instant::now();
            let result = dog.supervise(&job(budget), instance());
            assert_eq!(result.status, JobStatus::HardTimeout);
            assert!(started.elapsed() < limits.worst_case(budget) + Duration::from_secs(1));
            assert!(process_gone(dog.boundary.pids()[0]));
        }

        #[test]
        fn crashed_process_yields_no_result_without_waiting_out_budget() {
            let boundary = Recording::sh("cat >/dev/null; exit 7");
            let dog = Watchdog::new(boundary, fast_limits(), adapter_limits());
            let started = Instant::now();
            let result = dog.supervise(&job(Duration::from_secs(20)), instance());
            assert_eq!(result.status, JobStatus::NoResult);
            assert_eq!(result.objective_value, 0);
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn unlaunchable_worker_yields_no_result() {
            let boundary = ProcessBoundary::new("/nonexistent/kpbench-worker", vec![]);
            let dog = Watchdog::new(boundary, fast_limits(), adapter_limits());
            let result = dog.supervise(&job(Duration::from_secs(5)), instance());
            assert_eq!(result.status, JobStatus::NoResult);
        }
    }
}
