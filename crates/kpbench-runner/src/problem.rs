use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// A single 0/1 knapsack instance as read from a problem file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemInstance {
    pub values: Vec<u64>,
    pub weights: Vec<u64>,
    pub capacity: u64,
}

impl ProblemInstance {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("file is empty")]
    Empty,
    #[error("invalid capacity {0:?}")]
    Capacity(String),
    #[error("line {line}: invalid item field {token:?}")]
    Item { line: usize, token: String },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

pub fn read_problem_file(path: &Path) -> Result<ProblemInstance, ProblemError> {
    let data = fs::read_to_string(path)?;
    parse_problem(&data)
}

/// Parses the line-based problem format.
///
/// The first non-blank line is the capacity; every later non-blank line is
/// `<value> <weight>`. Lines with fewer than two tokens are skipped, extra
/// tokens are ignored.
pub fn parse_problem(data: &str) -> Result<ProblemInstance, ProblemError> {
    let mut lines = data
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty());

    let (_, first) = lines.next().ok_or(ProblemError::Empty)?;
    let capacity = first
        .parse::<u64>()
        .map_err(|_| ProblemError::Capacity(first.to_string()))?;

    let mut values = Vec::new();
    let mut weights = Vec::new();
    for (line_no, line) in lines {
        let mut tokens = line.split_whitespace();
        let (Some(value), Some(weight)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        values.push(parse_field(line_no, value)?);
        weights.push(parse_field(line_no, weight)?);
    }

    Ok(ProblemInstance {
        values,
        weights,
        capacity,
    })
}

fn parse_field(line: usize, token: &str) -> Result<u64, ProblemError> {
    token.parse::<u64>().map_err(|_| ProblemError::Item {
        line,
        token: token.to_string(),
    })
}
