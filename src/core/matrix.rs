use tracing::{debug, info};

use super::error::{GlidepathError, Result};
use super::factors::ReturnFactorTable;
use super::types::{Bucket, BucketSet, CostMatrixRow, GlidePlanEntry, MONTHS_PER_YEAR};

/// Worst-case cumulative growth per (bucket, horizon) and its inverse, the cost.
///
/// Horizon `h` holds a bucket for `h - 1` annual periods, so horizon 1 is the
/// empty product and always costs exactly 1.0. A cell with no full window in
/// the history is undefined rather than zero.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    buckets: BucketSet,
    max_horizon: u32,
    // min_factors[bucket column][horizon - 1]
    min_factors: Vec<Vec<Option<f64>>>,
}

impl CostMatrix {
    pub fn build(table: &ReturnFactorTable, max_horizon: u32) -> Result<Self> {
        if max_horizon == 0 {
            return Err(GlidepathError::InvalidConfig(
                "max horizon must be at least 1".to_string(),
            ));
        }

        let months = table.len();
        let step = MONTHS_PER_YEAR as usize;
        let mut min_factors = Vec::with_capacity(table.buckets().len());

        for &bucket in table.buckets().buckets() {
            let family = table.buckets().family();
            let column = table
                .column(bucket)
                .ok_or_else(|| GlidepathError::MissingColumn(bucket.label(family)))?;

            let mut row = Vec::with_capacity(max_horizon as usize);
            row.push(Some(1.0));

            // running[i] is the cumulative factor of the window starting at row i
            let mut running = vec![1.0_f64; months];
            for horizon in 2..=max_horizon {
                let last_offset = (horizon as usize - 2) * step;
                if last_offset >= months {
                    row.push(None);
                    continue;
                }
                let windows = months - last_offset;
                running.truncate(windows);
                for (start, acc) in running.iter_mut().enumerate() {
                    *acc *= column[start + last_offset];
                }
                let min = running.iter().copied().fold(f64::INFINITY, f64::min);
                row.push(Some(min));
            }
            min_factors.push(row);
        }

        info!(
            buckets = table.buckets().len(),
            max_horizon,
            months,
            "built cost matrix"
        );
        Ok(Self {
            buckets: table.buckets().clone(),
            max_horizon,
            min_factors,
        })
    }

    pub fn buckets(&self) -> &BucketSet {
        &self.buckets
    }

    pub fn max_horizon(&self) -> u32 {
        self.max_horizon
    }

    pub fn min_factor(&self, bucket: Bucket, horizon: u32) -> Option<f64> {
        let col = self.buckets.position(bucket)?;
        if horizon == 0 || horizon > self.max_horizon {
            return None;
        }
        self.min_factors[col][horizon as usize - 1]
    }

    pub fn cost(&self, bucket: Bucket, horizon: u32) -> Result<f64> {
        self.min_factor(bucket, horizon)
            .map(|min| 1.0 / min)
            .ok_or_else(|| GlidepathError::UndefinedCost {
                bucket: bucket.label(self.buckets.family()),
                horizon,
            })
    }

    pub fn rows(&self) -> Vec<CostMatrixRow> {
        self.buckets
            .buckets()
            .iter()
            .zip(&self.min_factors)
            .map(|(&bucket, mins)| CostMatrixRow {
                bucket,
                min_factors: mins.clone(),
                costs: mins.iter().map(|m| m.map(|v| 1.0 / v)).collect(),
            })
            .collect()
    }
}

/// Lowest-cost bucket per horizon, optionally with the rule that equity
/// never drops as the horizon lengthens. Equal costs go to the bucket with
/// more equity.
#[derive(Debug, Clone, PartialEq)]
pub struct GlidePlan {
    entries: Vec<GlidePlanEntry>,
}

impl GlidePlan {
    pub fn from_matrix(matrix: &CostMatrix, no_decrease_rule: bool) -> Self {
        let base = matrix.buckets().most_conservative();
        let mut entries = Vec::with_capacity(matrix.max_horizon() as usize);
        entries.push(GlidePlanEntry {
            horizon: 1,
            bucket: Some(base),
            equity_weight: Some(base.weight()),
            lowest_cost_value: Some(1.0),
        });

        let mut previous = base;
        for horizon in 2..=matrix.max_horizon() {
            let cheapest = matrix
                .buckets()
                .buckets()
                .iter()
                .filter_map(|&b| matrix.cost(b, horizon).ok().map(|c| (b, c)))
                .min_by(|(ba, ca), (bb, cb)| ca.total_cmp(cb).then(bb.cmp(ba)));

            let Some((mut bucket, _)) = cheapest else {
                debug!(horizon, "no bucket has a defined cost");
                entries.push(GlidePlanEntry {
                    horizon,
                    bucket: None,
                    equity_weight: None,
                    lowest_cost_value: None,
                });
                continue;
            };

            if no_decrease_rule && bucket < previous {
                bucket = previous;
            }
            previous = bucket;

            entries.push(GlidePlanEntry {
                horizon,
                bucket: Some(bucket),
                equity_weight: Some(bucket.weight()),
                lowest_cost_value: matrix.cost(bucket, horizon).ok(),
            });
        }

        Self { entries }
    }

    pub fn entry(&self, horizon: u32) -> Option<&GlidePlanEntry> {
        if horizon == 0 {
            return None;
        }
        self.entries.get(horizon as usize - 1)
    }

    pub fn entries(&self) -> &[GlidePlanEntry] {
        &self.entries
    }
}
