//! Isolation boundaries that run one Solver Adapter call out of the
//! orchestrator's reach.
//!
//! A boundary launches a worker and hands back a [`WorkerHandle`]. The handle
//! delivers at most one [`WorkerReply`] through a one-shot channel and can be
//! asked to stop, gracefully or by force. The Watchdog only ever talks to
//! these traits, so it does not care whether the worker is a child process
//! or a detached thread.

use crate::adapter::{AdapterLimits, AdapterReport, SolverAdapter};
use crate::model::Job;
use crate::problem::ProblemInstance;
use crate::solver::Solver;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long a worker that has already exited may keep its output pipe open
/// before it is declared lost.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Everything a worker needs; sent as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job: Job,
    pub instance: ProblemInstance,
    pub limits: AdapterLimits,
}

/// The single line a worker writes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub relative_path: String,
    pub report: AdapterReport,
}

#[derive(Debug)]
pub enum WorkerPoll {
    Delivered(WorkerReply),
    Pending,
    /// The worker is gone and no reply will ever arrive.
    Lost(String),
}

pub trait WorkerHandle: Send {
    /// Waits up to `wait` for the reply.
    fn poll(&mut self, wait: Duration) -> WorkerPoll;

    /// Asks the worker to stop.
    fn terminate(&mut self) -> Result<()>;

    fn force_kill(&mut self) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    fn describe(&self) -> String;
}

pub trait IsolationBoundary: Send + Sync {
    fn launch(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>>;
}

/// Runs each job in a child process speaking the worker protocol on
/// stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessBoundary {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessBoundary {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-executes the running binary as `<exe> worker`.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("locating current executable")?;
        Ok(Self::new(exe, vec!["worker".to_string()]))
    }
}

impl IsolationBoundary for ProcessBoundary {
    fn launch(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>> {
        let payload = serde_json::to_vec(&request)?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning worker {}", self.program.display()))?;
        let pid = child.id();
        trace!(target: "kpbench::isolation", pid, job = %request.job.relative_path, "worker spawned");

        // A worker that never reads its input must not block the supervisor.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&payload) {
                    debug!(target: "kpbench::isolation", pid, error = %e, "worker stdin closed early");
                }
            });
        }
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("worker stdout was not captured"));
            }
        };

        let (tx, rx) = mpsc::sync_channel(1);
        thread::spawn(move || {
            if let Some(reply) = read_reply(stdout) {
                let _ = tx.send(reply);
            }
        });

        Ok(Box::new(ProcessHandle {
            child,
            rx,
            exited_at: None,
        }))
    }
}

/// Keeps the last non-empty stdout line that parses as a reply.
fn read_reply(stdout: ChildStdout) -> Option<WorkerReply> {
    let mut reply = None;
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<WorkerReply>(line) {
            reply = Some(parsed);
        }
    }
    reply
}

struct ProcessHandle {
    child: Child,
    rx: Receiver<WorkerReply>,
    exited_at: Option<Instant>,
}

impl ProcessHandle {
    fn exit_note(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("worker exited ({status}) without a result"),
            Ok(None) => "worker closed its output without a result".to_string(),
            Err(e) => format!("worker state unknown: {e}"),
        }
    }
}

impl WorkerHandle for ProcessHandle {
    fn poll(&mut self, wait: Duration) -> WorkerPoll {
        match self.rx.recv_timeout(wait) {
            Ok(reply) => WorkerPoll::Delivered(reply),
            Err(RecvTimeoutError::Disconnected) => WorkerPoll::Lost(self.exit_note()),
            Err(RecvTimeoutError::Timeout) => match self.child.try_wait() {
                Ok(None) => WorkerPoll::Pending,
                Ok(Some(_)) => {
                    // Exited; give the reader a moment to hand over the tail.
                    let exited_at = *self.exited_at.get_or_insert_with(Instant::now);
                    if exited_at.elapsed() >= DRAIN_WINDOW {
                        WorkerPoll::Lost(self.exit_note())
                    } else {
                        WorkerPoll::Pending
                    }
                }
                Err(e) => WorkerPoll::Lost(format!("waiting on worker failed: {e}")),
            },
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        graceful_stop(&self.child)
    }

    fn force_kill(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            let _ = Command::new("taskkill")
                .args(["/F", "/T", "/PID", &self.child.id().to_string()])
                .status();
        }
        self.child.kill().context("killing worker")?;
        let _ = self.child.wait();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn describe(&self) -> String {
        format!("process {}", self.child.id())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let deadline = Instant::now() + DRAIN_WINDOW;
        while self.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.is_alive() {
            warn!(target: "kpbench::isolation", pid = self.child.id(), "reclaiming worker still running at release");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
fn graceful_stop(child: &Child) -> Result<()> {
    let pid = libc::pid_t::try_from(child.id()).context("worker pid out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("sending SIGTERM to worker");
    }
    Ok(())
}

#[cfg(not(unix))]
fn graceful_stop(child: &Child) -> Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &child.id().to_string()])
        .status()
        .context("running taskkill")?;
    if !status.success() {
        return Err(anyhow!("taskkill exited with {}", status));
    }
    Ok(())
}

/// Runs each job on a detached thread in this process.
///
/// Threads cannot be killed: an overrunning worker is abandoned and keeps
/// running until its solver returns.
pub struct ThreadBoundary<S> {
    solver: Arc<S>,
}

impl<S> ThreadBoundary<S> {
    pub fn new(solver: S) -> Self {
        Self {
            solver: Arc::new(solver),
        }
    }
}

impl<S: Solver + 'static> IsolationBoundary for ThreadBoundary<S> {
    fn launch(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let adapter = SolverAdapter::new(Arc::clone(&self.solver), request.limits);
        let label = request.job.relative_path.clone();
        let handle = thread::Builder::new()
            .name(format!("kpbench-worker:{label}"))
            .spawn(move || {
                let report = adapter.solve(&request.instance, request.job.time_budget);
                let _ = tx.send(WorkerReply {
                    relative_path: request.job.relative_path,
                    report,
                });
            })
            .context("spawning worker thread")?;
        Ok(Box::new(ThreadHandle {
            handle: Some(handle),
            rx,
            label,
        }))
    }
}

struct ThreadHandle {
    handle: Option<JoinHandle<()>>,
    rx: Receiver<WorkerReply>,
    label: String,
}

impl WorkerHandle for ThreadHandle {
    fn poll(&mut self, wait: Duration) -> WorkerPoll {
        match self.rx.recv_timeout(wait) {
            Ok(reply) => WorkerPoll::Delivered(reply),
            Err(RecvTimeoutError::Timeout) => WorkerPoll::Pending,
            Err(RecvTimeoutError::Disconnected) => {
                let note = match self.handle.take().map(JoinHandle::join) {
                    Some(Err(_)) => "worker thread panicked without a result",
                    _ => "worker thread ended without a result",
                };
                WorkerPoll::Lost(note.to_string())
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        debug!(target: "kpbench::isolation", worker = %self.label, "thread worker cannot be interrupted; abandoning");
        Ok(())
    }

    fn force_kill(&mut self) -> Result<()> {
        if self.is_alive() {
            return Err(anyhow!("thread worker {} cannot be killed", self.label));
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn describe(&self) -> String {
        format!("thread {}", self.label)
    }
}

/// Worker side of [`ProcessBoundary`]: reads one request, solves it, writes
/// one reply line.
pub fn serve_worker<S: Solver>(input: impl Read, mut output: impl Write, solver: S) -> Result<()> {
    let request: WorkerRequest =
        serde_json::from_reader(input).context("decoding worker request")?;
    let adapter = SolverAdapter::new(solver, request.limits);
    let report = adapter.solve(&request.instance, request.job.time_budget);
    let reply = WorkerReply {
        relative_path: request.job.relative_path,
        report,
    };
    let mut line = serde_json::to_vec(&reply)?;
    line.push(b'\n');
    output.write_all(&line)?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_solvers::Sleepy;
    use crate::model::JobStatus;
    use crate::solver::BranchAndBound;

    fn request(budget: Duration) -> WorkerRequest {
        WorkerRequest {
            job: Job {
                group: "g".to_string(),
                size_label: "n3".to_string(),
                source_path: PathBuf::from("g/n3/t/a.kp"),
                relative_path: "g/n3/t/a.kp".to_string(),
                time_budget: budget,
            },
            instance: ProblemInstance {
                values: vec![60, 100, 120],
                weights: vec![10, 20, 30],
                capacity: 50,
            },
            limits: AdapterLimits::default(),
        }
    }

    fn wait_for(handle: &mut Box<dyn WorkerHandle>, limit: Duration) -> WorkerPoll {
        let deadline = Instant::now() + limit;
        loop {
            match handle.poll(Duration::from_millis(20)) {
                WorkerPoll::Pending if Instant::now() < deadline => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn serve_worker_writes_one_reply_line() {
        let input = serde_json::to_vec(&request(Duration::from_secs(30))).expect("encode");
        let mut out = Vec::new();
        serve_worker(input.as_slice(), &mut out, BranchAndBound).expect("serve");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text.lines().count(), 1);
        let reply: WorkerReply = serde_json::from_str(text.trim()).expect("decode");
        assert_eq!(reply.relative_path, "g/n3/t/a.kp");
        assert_eq!(reply.report.status, JobStatus::Solved);
        assert_eq!(reply.report.outcome.objective_value, 220);
    }

    #[test]
    fn serve_worker_rejects_garbage() {
        let mut out = Vec::new();
        assert!(serve_worker(&b"not json"[..], &mut out, BranchAndBound).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn thread_boundary_delivers_reply() {
        let boundary = ThreadBoundary::new(BranchAndBound);
        let mut handle = boundary
            .launch(request(Duration::from_secs(30)))
            .expect("launch");
        match wait_for(&mut handle, Duration::from_secs(5)) {
            WorkerPoll::Delivered(reply) => {
                assert_eq!(reply.report.outcome.total_weight, 50)
            }
            other => panic!("unexpected poll: {other:?}"),
        }
    }

    #[test]
    fn thread_worker_cannot_be_force_killed_while_running() {
        let boundary = ThreadBoundary::new(Sleepy(Duration::from_millis(300)));
        let mut handle = boundary
            .launch(request(Duration::from_secs(30)))
            .expect("launch");
        assert!(handle.is_alive());
        assert!(handle.terminate().is_ok());
        assert!(handle.force_kill().is_err());
    }

    #[cfg(unix)]
    fn sh(script: &str) -> ProcessBoundary {
        ProcessBoundary::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[test]
    fn process_boundary_takes_last_reply_line() {
        let reply = WorkerReply {
            relative_path: "g/n3/t/a.kp".to_string(),
            report: AdapterReport {
                outcome: crate::model::SolveOutcome::empty(Duration::from_millis(5)),
                status: JobStatus::Solved,
            },
        };
        let json = serde_json::to_string(&reply).expect("encode");
        let script = format!("cat >/dev/null; echo 'solver banner'; printf '%s\\n' '{json}'");
        let mut handle = sh(&script)
            .launch(request(Duration::from_secs(5)))
            .expect("launch");
        match wait_for(&mut handle, Duration::from_secs(5)) {
            WorkerPoll::Delivered(got) => assert_eq!(got, reply),
            other => panic!("unexpected poll: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn crashed_process_is_reported_lost() {
        let mut handle = sh("cat >/dev/null; exit 3")
            .launch(request(Duration::from_secs(5)))
            .expect("launch");
        match wait_for(&mut handle, Duration::from_secs(5)) {
            WorkerPoll::Lost(note) => assert!(note.contains("without a result"), "{note}"),
            other => panic!("unexpected poll: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn hung_process_stops_on_sigterm() {
        let mut handle = sh("exec sleep 30")
            .launch(request(Duration::from_secs(5)))
            .expect("launch");
        assert!(matches!(handle.poll(Duration::from_millis(50)), WorkerPoll::Pending));
        handle.terminate().expect("sigterm");
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!handle.is_alive());
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let boundary = ProcessBoundary::new("/nonexistent/kpbench-worker", vec![]);
        assert!(boundary.launch(request(Duration::from_secs(1))).is_err());
    }
}
