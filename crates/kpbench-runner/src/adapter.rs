//! In-process wrapper around a [`Solver`].
//!
//! The adapter never fails: every solver error, panic or inconsistent answer
//! becomes a zeroed [`SolveOutcome`] with a non-solved status. Deadlines are
//! plain monotonic instants checked after the blocking call returns.

use crate::model::{JobStatus, SolveOutcome};
use crate::problem::ProblemInstance;
use crate::solver::{deadline_after, Solver, SolverAnswer};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterLimits {
    /// Reserved below the budget when telling the solver how long it may run.
    pub solver_margin: Duration,
    /// The soft deadline fires this long before the budget expires.
    pub soft_margin: Duration,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            solver_margin: Duration::from_secs(10),
            soft_margin: Duration::from_secs(5),
        }
    }
}

impl AdapterLimits {
    /// Strictly below `budget` for any non-zero budget.
    pub fn solver_allowance(&self, budget: Duration) -> Duration {
        if budget > self.solver_margin {
            budget - self.solver_margin
        } else {
            budget / 2
        }
    }

    pub fn soft_after(&self, budget: Duration) -> Duration {
        if budget > self.soft_margin {
            budget - self.soft_margin
        } else {
            budget
        }
    }
}

/// Armed for the duration of one solver call and disarmed on drop.
pub struct SoftDeadline {
    fires_at: Instant,
    armed: bool,
}

impl SoftDeadline {
    pub fn arm(after: Duration) -> Self {
        debug!(target: "kpbench::adapter", after_ms = after.as_millis() as u64, "soft deadline armed");
        Self {
            fires_at: deadline_after(Instant::now(), after),
            armed: true,
        }
    }

    pub fn fired(&self) -> bool {
        Instant::now() >= self.fires_at
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn disarm(&mut self) {
        if self.armed {
            self.armed = false;
            debug!(target: "kpbench::adapter", "soft deadline disarmed");
        }
    }
}

impl Drop for SoftDeadline {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// A normalized outcome plus the status the adapter assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterReport {
    pub outcome: SolveOutcome,
    pub status: JobStatus,
}

pub struct SolverAdapter<S> {
    solver: S,
    limits: AdapterLimits,
}

impl<S: Solver> SolverAdapter<S> {
    pub fn new(solver: S, limits: AdapterLimits) -> Self {
        Self { solver, limits }
    }

    pub fn solve(&self, instance: &ProblemInstance, time_budget: Duration) -> AdapterReport {
        let started = Instant::now();
        let allowance = self.limits.solver_allowance(time_budget);
        let mut soft = SoftDeadline::arm(self.limits.soft_after(time_budget));

        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            self.solver.solve(
                &instance.values,
                &instance.weights,
                instance.capacity,
                allowance,
            )
        }));
        let soft_fired = soft.fired();
        soft.disarm();
        let elapsed = started.elapsed();

        let answer = match call {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return self.failure(format!("{:#}", e), elapsed),
            Err(payload) => return self.failure(panic_message(payload), elapsed),
        };
        let total_weight = match checked_weight(instance, &answer) {
            Ok(weight) => weight,
            Err(e) => {
                error!(target: "kpbench::adapter", solver = self.solver.name(), error = %e, "solver returned an inconsistent selection");
                return self.failure(e.to_string(), elapsed);
            }
        };

        let overran = elapsed > time_budget;
        let timed_out = soft_fired || overran;
        if timed_out {
            warn!(
                target: "kpbench::adapter",
                solver = self.solver.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = time_budget.as_millis() as u64,
                soft_fired,
                "solver ran past its soft deadline; result marked non-optimal"
            );
        }
        AdapterReport {
            outcome: SolveOutcome {
                objective_value: answer.objective_value,
                selected_items: answer.selected_items,
                total_weight,
                is_optimal: answer.is_optimal && !timed_out,
                elapsed,
            },
            status: if timed_out {
                JobStatus::SoftTimeout
            } else {
                JobStatus::Solved
            },
        }
    }

    fn failure(&self, message: String, elapsed: Duration) -> AdapterReport {
        warn!(target: "kpbench::adapter", solver = self.solver.name(), error = %message, "solver call failed");
        AdapterReport {
            outcome: SolveOutcome::empty(elapsed),
            status: JobStatus::SolverError(message),
        }
    }
}

fn checked_weight(instance: &ProblemInstance, answer: &SolverAnswer) -> Result<u64> {
    let mut total: u64 = 0;
    let mut value: u64 = 0;
    for &i in &answer.selected_items {
        let (w, v) = instance
            .weights
            .get(i)
            .zip(instance.values.get(i))
            .ok_or_else(|| anyhow!("selected item {} out of range ({} items)", i, instance.len()))?;
        total = total
            .checked_add(*w)
            .ok_or_else(|| anyhow!("selected weight overflows"))?;
        value = value.saturating_add(*v);
    }
    if total > instance.capacity {
        return Err(anyhow!(
            "selected weight {} exceeds capacity {}",
            total,
            instance.capacity
        ));
    }
    if value != answer.objective_value {
        return Err(anyhow!(
            "reported value {} does not match selected items ({})",
            answer.objective_value,
            value
        ));
    }
    Ok(total)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("solver panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("solver panicked: {}", s)
    } else {
        "solver panicked".to_string()
    }
}
