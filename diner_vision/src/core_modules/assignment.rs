// THEORY:
// Data association as a minimum-cost bipartite assignment between the tracker's tracklets
// (rows) and the current frame's observations (columns).
//
// Key architectural principles:
// 1.  **Never Force a Match**: The square matrix handed to the solver is augmented with a
//     dummy row per observation and a dummy column per tracklet. Leaving either side
//     unmatched costs half the gate, so a real pair is only chosen when it is cheaper than
//     leaving both ends alone, and any pair at or above the gate is never returned.
// 2.  **Deterministic Ties**: Each observation carries a rank (confidence descending, then
//     index). A tiny rank-proportional bias makes equidistant candidates resolve in favour
//     of the higher-confidence, lower-index observation. The whole bias range stays below
//     a ten-thousandth of the gate and the dummy costs absorb it, so the solver and
//     `greedy` admit exactly the same pairs: those whose raw cost is below the gate.
// 3.  **Bounded Work**: Problems larger than the configured size, or that the solver fails
//     on, are reported as `AssignmentTimeout`. The caller degrades to `greedy` for that
//     frame only.

use lapjv::{Matrix, lapjv};
use log::trace;

use crate::error::{Result, VisionError};

const INVALID_MATCH: f32 = 1_000_000.0;
/// Share of the gate spread across the observation ranks.
const TIE_BREAK_SHARE: f64 = 1e-4;

/// Tracklet x observation association costs. Row-major.
#[derive(Debug, Clone)]
pub struct CostMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl CostMatrix {
    pub fn from_fn(rows: usize, cols: usize, mut cost: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                data.push(cost(row, col));
            }
        }
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// `(tracklet row, observation column)` pairs.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

impl Assignment {
    fn from_pairs(rows: usize, cols: usize, mut matches: Vec<(usize, usize)>) -> Self {
        matches.sort_unstable();
        let mut row_taken = vec![false; rows];
        let mut col_taken = vec![false; cols];
        for &(row, col) in &matches {
            row_taken[row] = true;
            col_taken[col] = true;
        }
        Self {
            matches,
            unmatched_rows: (0..rows).filter(|r| !row_taken[*r]).collect(),
            unmatched_cols: (0..cols).filter(|c| !col_taken[*c]).collect(),
        }
    }
}

/// Ranks observation columns by confidence descending, then by index.
pub fn observation_ranks(confidences: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..confidences.len()).collect();
    order.sort_by(|&a, &b| confidences[b].total_cmp(&confidences[a]).then(a.cmp(&b)));
    let mut ranks = vec![0; confidences.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank;
    }
    ranks
}

/// Optimal assignment restricted to pairs cheaper than `gate`.
pub fn solve(
    costs: &CostMatrix,
    ranks: &[usize],
    gate: f64,
    max_size: usize,
) -> Result<Assignment> {
    let (rows, cols) = (costs.rows(), costs.cols());
    if rows == 0 || cols == 0 {
        return Ok(Assignment::from_pairs(rows, cols, Vec::new()));
    }

    let dims = rows + cols;
    if dims > max_size {
        return Err(VisionError::AssignmentTimeout {
            size: dims,
            reason: format!("exceeds the per-frame budget of {max_size}"),
        });
    }

    let bias_step = gate * TIE_BREAK_SHARE / cols as f64;
    let max_bias = bias_step * cols as f64;
    // Two dummies outweigh any admissible pair, bias included.
    let unmatched_cost = ((gate + max_bias) / 2.0) as f32;
    let matrix = Matrix::from_shape_fn((dims, dims), |(row, col)| {
        match (row < rows, col < cols) {
            (true, true) => {
                let cost = costs.get(row, col);
                if cost.is_finite() && cost < gate {
                    (cost + ranks[col] as f64 * bias_step) as f32
                } else {
                    INVALID_MATCH
                }
            }
            (true, false) | (false, true) => unmatched_cost,
            (false, false) => 0.0,
        }
    });

    let (row_to_col, _) = lapjv(&matrix).map_err(|err| VisionError::AssignmentTimeout {
        size: dims,
        reason: format!("solver failed: {err:?}"),
    })?;

    let matches = row_to_col
        .iter()
        .enumerate()
        .filter(|&(row, &col)| row < rows && col < cols && costs.get(row, col) < gate)
        .map(|(row, &col)| (row, col))
        .collect::<Vec<_>>();
    trace!("lapjv assigned {} of {rows}x{cols}", matches.len());
    Ok(Assignment::from_pairs(rows, cols, matches))
}

/// Greedy nearest-neighbour matching: cheapest admissible pair first, ties broken by
/// observation rank and then tracklet row.
pub fn greedy(costs: &CostMatrix, ranks: &[usize], gate: f64) -> Assignment {
    let (rows, cols) = (costs.rows(), costs.cols());
    let mut candidates = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let cost = costs.get(row, col);
            if cost.is_finite() && cost < gate {
                candidates.push((cost, ranks[col], row, col));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut row_taken = vec![false; rows];
    let mut col_taken = vec![false; cols];
    let mut matches = Vec::new();
    for (_, _, row, col) in candidates {
        if row_taken[row] || col_taken[col] {
            continue;
        }
        row_taken[row] = true;
        col_taken[col] = true;
        matches.push((row, col));
    }
    Assignment::from_pairs(rows, cols, matches)
}
