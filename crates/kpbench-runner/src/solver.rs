use anyhow::{anyhow, Result};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stand-in horizon for budgets too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `start + after`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// What a solver reports for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverAnswer {
    pub objective_value: u64,
    pub selected_items: BTreeSet<usize>,
    pub is_optimal: bool,
}

/// A blocking, best-effort knapsack solver.
///
/// Implementations are expected to return within `time_limit`, but nothing
/// relies on it: callers bound them from outside.
pub trait Solver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(
        &self,
        values: &[u64],
        weights: &[u64],
        capacity: u64,
        time_limit: Duration,
    ) -> Result<SolverAnswer>;
}

impl<T: Solver + ?Sized> Solver for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn solve(
        &self,
        values: &[u64],
        weights: &[u64],
        capacity: u64,
        time_limit: Duration,
    ) -> Result<SolverAnswer> {
        (**self).solve(values, weights, capacity, time_limit)
    }
}

const CLOCK_CHECK_INTERVAL: u64 = 1024;

/// Depth-first branch and bound with a fractional upper bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchAndBound;

#[derive(Clone, Copy)]
enum Branch {
    Take,
    Skip,
}

struct Item {
    index: usize,
    value: u64,
    weight: u64,
}

impl Solver for BranchAndBound {
    fn name(&self) -> &'static str {
        "branch_and_bound"
    }

    fn solve(
        &self,
        values: &[u64],
        weights: &[u64],
        capacity: u64,
        time_limit: Duration,
    ) -> Result<SolverAnswer> {
        if values.len() != weights.len() {
            return Err(anyhow!(
                "values/weights length mismatch: {} vs {}",
                values.len(),
                weights.len()
            ));
        }
        let deadline = deadline_after(Instant::now(), time_limit);
        let mut items: Vec<Item> = values
            .iter()
            .zip(weights)
            .enumerate()
            .map(|(index, (&value, &weight))| Item {
                index,
                value,
                weight,
            })
            .collect();
        items.sort_by(by_density);

        let n = items.len();
        let mut chosen = vec![false; n];
        let mut best_value = 0u64;
        let mut best_chosen = chosen.clone();
        let mut timed_out = false;
        let mut nodes = 0u64;
        let mut stack = vec![(0usize, 0u64, 0u64, Branch::Take)];

        while let Some((idx, weight, value, branch)) = stack.pop() {
            nodes += 1;
            if nodes % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            if idx == n {
                if value > best_value {
                    best_value = value;
                    best_chosen.copy_from_slice(&chosen);
                }
                continue;
            }
            if upper_bound(&items[idx..], capacity - weight, value) <= best_value {
                continue;
            }
            match branch {
                Branch::Take => {
                    stack.push((idx, weight, value, Branch::Skip));
                    let item = &items[idx];
                    if item.weight <= capacity - weight {
                        chosen[idx] = true;
                        stack.push((idx + 1, weight + item.weight, value + item.value, Branch::Take));
                    }
                }
                Branch::Skip => {
                    chosen[idx] = false;
                    stack.push((idx + 1, weight, value, Branch::Take));
                }
            }
        }

        let selected_items = items
            .iter()
            .zip(&best_chosen)
            .filter(|(_, taken)| **taken)
            .map(|(item, _)| item.index)
            .collect();
        Ok(SolverAnswer {
            objective_value: best_value,
            selected_items,
            is_optimal: !timed_out,
        })
    }
}

/// Highest value per unit of weight first; weightless items lead.
fn by_density(a: &Item, b: &Item) -> Ordering {
    match (a.weight == 0, b.weight == 0) {
        (true, true) => b.value.cmp(&a.value),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => {
            let lhs = a.value as u128 * b.weight as u128;
            let rhs = b.value as u128 * a.weight as u128;
            rhs.cmp(&lhs)
        }
    }
}

/// Greedy fractional relaxation over the remaining, density-ordered items.
fn upper_bound(items: &[Item], mut room: u64, value: u64) -> u64 {
    let mut bound = value as u128;
    for item in items {
        if item.weight <= room {
            room -= item.weight;
            bound += item.value as u128;
        } else {
            bound += item.value as u128 * room as u128 / item.weight as u128;
            break;
        }
    }
    u64::try_from(bound).unwrap_or(u64::MAX)
}
