use super::error::{GlidepathError, Result};
use super::matrix::{CostMatrix, GlidePlan};
use super::types::Bucket;

/// Picks the bucket a path holds each year.
///
/// The initial bucket comes from the glide plan for the full horizon. After
/// that the selector only ever moves to a bucket with strictly less equity,
/// so equity exposure within a path is a one-way ratchet toward safety.
#[derive(Debug, Clone, Copy)]
pub struct AllocationSelector<'a> {
    matrix: &'a CostMatrix,
    plan: &'a GlidePlan,
    rounding_precision: u32,
}

impl<'a> AllocationSelector<'a> {
    pub fn new(matrix: &'a CostMatrix, plan: &'a GlidePlan, rounding_precision: u32) -> Self {
        Self {
            matrix,
            plan,
            rounding_precision,
        }
    }

    pub fn plan(&self) -> &'a GlidePlan {
        self.plan
    }

    /// Bucket used for year 2 of a path of `horizon` years.
    pub fn initial(&self, horizon: u32) -> Result<Bucket> {
        let weight = self.plan.entry(horizon).and_then(|e| e.equity_weight);
        let unresolved = || GlidepathError::UnresolvedAllocation {
            horizon,
            equity_weight: weight,
        };
        let rounded = round_to(weight.ok_or_else(unresolved)?, self.rounding_precision);
        self.matrix
            .buckets()
            .buckets()
            .iter()
            .copied()
            .find(|b| (b.weight() - rounded).abs() < 1e-9)
            .ok_or_else(unresolved)
    }

    /// Bucket for the next year given the value reached so far and the
    /// number of matrix years still ahead (including the year being entered).
    pub fn next(&self, current: Bucket, value: f64, remaining_horizon: u32) -> Bucket {
        self.matrix
            .buckets()
            .buckets()
            .iter()
            .copied()
            .filter(|b| *b < current)
            .filter(|b| {
                self.matrix
                    .cost(*b, remaining_horizon)
                    .map(|cost| cost <= value)
                    .unwrap_or(false)
            })
            .min()
            .unwrap_or(current)
    }
}

/// Matrix horizon still ahead when a path of `horizon` years enters `year`.
pub fn remaining_horizon(horizon: u32, year: u32) -> u32 {
    horizon - year + 2
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}
