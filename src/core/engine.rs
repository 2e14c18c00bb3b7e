use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, info, info_span, warn};

use super::error::{GlidepathError, Result};
use super::factors::ReturnFactorTable;
use super::matrix::{CostMatrix, GlidePlan};
use super::selector::AllocationSelector;
use super::simulator::PathSimulator;
use super::types::{
    AggregationPolicy, AllocationPath, AuditRow, EndingValueStats, ExcludedPath, ExclusionSummary,
    HorizonSummary, HorizonTable, MONTHS_PER_YEAR, MonthIndex, PathFailure, SimulationBatch,
    SimulationConfig, StartMonthValue, StartMonthValues, StudyReport,
};

/// Immutable inputs shared by every path of a study: the (possibly blended
/// and narrowed) factor table, its cost matrix and the glide plan.
#[derive(Debug, Clone)]
pub struct GlidePathModel {
    table: ReturnFactorTable,
    matrix: CostMatrix,
    plan: GlidePlan,
    config: SimulationConfig,
}

impl GlidePathModel {
    pub fn prepare(table: &ReturnFactorTable, config: &SimulationConfig) -> Result<Self> {
        validate_config(config)?;

        let mut table = match config.blend_step_pct {
            Some(step) => table.with_blended_buckets(step)?,
            None => table.clone(),
        };
        if let Some(subset) = &config.buckets {
            table = table.select(subset)?;
        }

        let supported = supported_max_horizon(&table);
        if config.max_horizon > supported {
            return Err(GlidepathError::InvalidConfig(format!(
                "max horizon {} needs more history than the {} months in the table \
                 (at most {supported})",
                config.max_horizon,
                table.len()
            )));
        }

        let matrix = CostMatrix::build(&table, config.max_horizon)?;
        let plan = GlidePlan::from_matrix(&matrix, config.no_decrease_rule);
        Ok(Self {
            table,
            matrix,
            plan,
            config: config.clone(),
        })
    }

    pub fn table(&self) -> &ReturnFactorTable {
        &self.table
    }

    pub fn matrix(&self) -> &CostMatrix {
        &self.matrix
    }

    pub fn plan(&self) -> &GlidePlan {
        &self.plan
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn simulator(&self) -> PathSimulator<'_> {
        let selector =
            AllocationSelector::new(&self.matrix, &self.plan, self.config.rounding_precision);
        PathSimulator::new(&self.table, selector, self.config.seed_policy)
    }

    /// Every starting month whose path of `horizon` years fits in the table.
    pub fn default_start_months(&self, horizon: u32) -> Vec<MonthIndex> {
        let first = self.table.first_month();
        let last = self.table.last_month();
        let Some(span) = horizon.saturating_sub(2).checked_mul(MONTHS_PER_YEAR) else {
            return Vec::new();
        };
        match last.checked_sub(span) {
            Some(last_start) if last_start >= first => (first..=last_start).collect(),
            _ => Vec::new(),
        }
    }

    /// Starting months for `horizon`: the configured range clipped to the
    /// table, otherwise [`default_start_months`](Self::default_start_months).
    pub fn start_months(&self, horizon: u32) -> Vec<MonthIndex> {
        match self.config.start_months {
            Some((from, to)) => {
                let from = from.max(self.table.first_month());
                let to = to.min(self.table.last_month());
                (from..=to).collect()
            }
            None => self.default_start_months(horizon),
        }
    }

    /// Months of the configured start range that lie outside the table.
    pub fn start_months_outside_table(&self) -> u64 {
        let Some((from, to)) = self.config.start_months else {
            return 0;
        };
        let requested = u64::from(to - from) + 1;
        let first = from.max(self.table.first_month());
        let last = to.min(self.table.last_month());
        let kept = if first <= last {
            u64::from(last - first) + 1
        } else {
            0
        };
        requested - kept
    }

    /// Simulates every starting month independently; results are merged by
    /// index so the batch order matches `start_months`.
    pub fn run_batch(&self, horizon: u32, start_months: &[MonthIndex]) -> SimulationBatch {
        let simulator = self.simulator();
        let run_one = |&start: &MonthIndex| {
            if !self.table.contains_month(start) {
                return Err(PathFailure {
                    start_month: start,
                    horizon,
                    truncated_at_year: None,
                    error: GlidepathError::OutOfRange {
                        start_month: start,
                        year: 1,
                        month: start,
                        first_month: self.table.first_month(),
                        last_month: self.table.last_month(),
                    },
                });
            }
            simulator.simulate(start, horizon)
        };

        let results: Vec<_> = if self.config.parallel {
            start_months.par_iter().map(run_one).collect()
        } else {
            start_months.iter().map(run_one).collect()
        };

        let mut paths = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(path) => paths.push(path),
                Err(failure) => {
                    debug!(
                        horizon,
                        start_month = failure.start_month,
                        truncated_at_year = failure.truncated_at_year,
                        error = %failure.error,
                        "path excluded"
                    );
                    failures.push(failure);
                }
            }
        }

        if !failures.is_empty() {
            warn!(
                horizon,
                excluded = failures.len(),
                completed = paths.len(),
                "batch excluded paths"
            );
        }
        info!(horizon, paths = paths.len(), "simulated batch");

        SimulationBatch {
            horizon,
            paths,
            failures,
        }
    }
}

/// Longest horizon worth costing: one more than the longest full window.
fn supported_max_horizon(table: &ReturnFactorTable) -> u32 {
    let years = table.len() / MONTHS_PER_YEAR as usize + 2;
    u32::try_from(years).unwrap_or(u32::MAX)
}

fn validate_config(config: &SimulationConfig) -> Result<()> {
    if config.min_horizon == 0 {
        return Err(GlidepathError::InvalidConfig(
            "min horizon must be at least 1".to_string(),
        ));
    }
    if config.max_horizon < config.min_horizon {
        return Err(GlidepathError::InvalidConfig(format!(
            "max horizon {} is below min horizon {}",
            config.max_horizon, config.min_horizon
        )));
    }
    if let Some((from, to)) = config.start_months {
        if from > to {
            return Err(GlidepathError::InvalidConfig(format!(
                "start month range {from}..={to} is empty"
            )));
        }
    }
    if config.rounding_precision > 9 {
        return Err(GlidepathError::InvalidConfig(
            "rounding precision must be at most 9 decimal places".to_string(),
        ));
    }
    Ok(())
}

/// Reduces a batch into per-year tables.
pub fn summarize(
    batch: &SimulationBatch,
    policy: &AggregationPolicy,
    include_audit: bool,
) -> HorizonSummary {
    let aggregated = aggregated_paths(batch, policy);
    let years = batch.horizon as usize;

    let mut year_totals = vec![0.0; years];
    let mut weighted_num = vec![0.0; years];
    let mut weighted_den = vec![0.0; years];
    for path in aggregated {
        for (idx, record) in path.records.iter().enumerate() {
            year_totals[idx] += record.value;
            if record.value != 0.0 {
                let weight = record.bucket.map(|b| b.weight()).unwrap_or(0.0);
                weighted_num[idx] += weight * record.value;
                weighted_den[idx] += record.value;
            }
        }
    }
    if let (Some(first), Some(offset)) = (year_totals.first_mut(), policy.year_one_total_offset) {
        *first += offset;
    }

    let mut weighted_allocation: Vec<f64> = weighted_num
        .iter()
        .zip(&weighted_den)
        .map(|(num, den)| if *den == 0.0 { 0.0 } else { num / den })
        .collect();
    if let Some(first) = weighted_allocation.first_mut() {
        *first = 0.0;
    }

    let last_non_zero = aggregated
        .iter()
        .map(|path| StartMonthValue {
            start_month: path.start_month,
            value: path.last_non_zero_value(),
        })
        .collect();
    let ending_values = aggregated
        .iter()
        .map(|path| StartMonthValues {
            start_month: path.start_month,
            values: path.records.iter().map(|r| Some(r.value)).collect(),
        })
        .collect();

    let audit = include_audit.then(|| {
        batch
            .paths
            .iter()
            .flat_map(|path| {
                path.records.iter().map(move |r| AuditRow {
                    start_month: path.start_month,
                    year: r.year,
                    bucket: r.bucket,
                    factor: r.factor,
                    value: r.value,
                })
            })
            .collect()
    });

    HorizonSummary {
        horizon: batch.horizon,
        paths_simulated: batch.paths.len() + batch.failures.len(),
        paths_aggregated: aggregated.len(),
        year_totals,
        weighted_allocation,
        last_non_zero,
        ending_values,
        audit,
        excluded: batch.failures.iter().map(ExcludedPath::from).collect(),
    }
}

fn aggregated_paths<'b>(
    batch: &'b SimulationBatch,
    policy: &AggregationPolicy,
) -> &'b [AllocationPath] {
    match (batch.horizon, policy.unit_horizon_trailing_drop) {
        (1, Some(drop)) => {
            let keep = batch.paths.len().saturating_sub(drop);
            &batch.paths[..keep]
        }
        _ => &batch.paths,
    }
}

/// Terminal value of every horizon's path per starting month.
pub fn combined_table(batches: &[SimulationBatch]) -> HorizonTable {
    let horizons: Vec<u32> = batches.iter().map(|b| b.horizon).collect();
    let mut rows: BTreeMap<MonthIndex, Vec<Option<f64>>> = BTreeMap::new();
    for (col, batch) in batches.iter().enumerate() {
        let months = batch
            .paths
            .iter()
            .map(|p| p.start_month)
            .chain(batch.failures.iter().map(|f| f.start_month));
        for month in months {
            rows.entry(month).or_insert_with(|| vec![None; batches.len()]);
        }
        for path in &batch.paths {
            if let Some(row) = rows.get_mut(&path.start_month) {
                row[col] = Some(path.terminal_value());
            }
        }
    }
    horizon_table(horizons, rows)
}

/// Ending values of the static glide: each horizon holds the plan's bucket
/// for that horizon throughout. Missing history or plan entries give `None`.
pub fn static_ending_values(
    table: &ReturnFactorTable,
    plan: &GlidePlan,
    start_months: &[MonthIndex],
    horizons: &[u32],
) -> HorizonTable {
    let mut rows = BTreeMap::new();
    for &start in start_months {
        let values = horizons
            .iter()
            .map(|&horizon| {
                let bucket = plan.entry(horizon)?.bucket?;
                (0..horizon.saturating_sub(1)).try_fold(1.0, |acc, k| {
                    let month = k
                        .checked_mul(MONTHS_PER_YEAR)
                        .and_then(|offset| start.checked_add(offset))?;
                    table.get(month, bucket).map(|factor| acc * factor)
                })
            })
            .collect();
        rows.insert(start, values);
    }
    horizon_table(horizons.to_vec(), rows)
}

fn horizon_table(
    horizons: Vec<u32>,
    rows: BTreeMap<MonthIndex, Vec<Option<f64>>>,
) -> HorizonTable {
    let rows: Vec<StartMonthValues> = rows
        .into_iter()
        .map(|(start_month, values)| StartMonthValues {
            start_month,
            values,
        })
        .collect();
    let normalized = normalize_columns(&rows, horizons.len());
    HorizonTable {
        horizons,
        rows,
        normalized,
    }
}

/// Divides every column by its smallest non-zero value.
fn normalize_columns(rows: &[StartMonthValues], width: usize) -> Vec<StartMonthValues> {
    let minima: Vec<Option<f64>> = (0..width)
        .map(|col| {
            rows.iter()
                .filter_map(|r| r.values[col])
                .filter(|v| *v != 0.0)
                .min_by(|a, b| a.total_cmp(b))
        })
        .collect();

    rows.iter()
        .map(|row| StartMonthValues {
            start_month: row.start_month,
            values: row
                .values
                .iter()
                .zip(&minima)
                .map(|(value, min)| match (value, min) {
                    (Some(v), Some(m)) => Some(v / m),
                    _ => None,
                })
                .collect(),
        })
        .collect()
}

/// Lowest and median of the per-row averages of a horizon table.
pub fn ending_value_stats(table: &HorizonTable) -> EndingValueStats {
    let mut averages: Vec<f64> = table
        .rows
        .iter()
        .filter_map(|row| {
            let defined: Vec<f64> = row.values.iter().flatten().copied().collect();
            if defined.is_empty() {
                None
            } else {
                Some(defined.iter().sum::<f64>() / defined.len() as f64)
            }
        })
        .collect();

    if averages.is_empty() {
        return EndingValueStats {
            lowest_average: None,
            median_average: None,
        };
    }
    let lowest = averages.iter().copied().fold(f64::INFINITY, f64::min);
    EndingValueStats {
        lowest_average: Some(lowest),
        median_average: Some(percentile(&mut averages, 50.0)),
    }
}

/// Counts failed paths by kind. `start_months_outside_table` is carried
/// through from [`GlidePathModel::start_months_outside_table`].
pub fn summarize_exclusions(
    batches: &[SimulationBatch],
    start_months_outside_table: u64,
) -> ExclusionSummary {
    let paths: Vec<ExcludedPath> = batches
        .iter()
        .flat_map(|b| b.failures.iter().map(ExcludedPath::from))
        .collect();
    let count = |kind: &str| paths.iter().filter(|p| p.kind == kind).count();
    let out_of_range = count("out-of-range");
    let unresolved_allocation = count("unresolved-allocation");
    ExclusionSummary {
        total: paths.len(),
        out_of_range,
        unresolved_allocation,
        other: paths.len() - out_of_range - unresolved_allocation,
        start_months_outside_table,
        paths,
    }
}

/// Runs every horizon in the configured range and assembles the report.
pub fn run_study(table: &ReturnFactorTable, config: &SimulationConfig) -> Result<StudyReport> {
    let span = info_span!(
        "study",
        min_horizon = config.min_horizon,
        max_horizon = config.max_horizon
    );
    let _guard = span.enter();

    let model = GlidePathModel::prepare(table, config)?;
    let outside_table = model.start_months_outside_table();
    if outside_table > 0 {
        warn!(
            months = outside_table,
            first_month = model.table().first_month(),
            last_month = model.table().last_month(),
            "start month range extends past the table; clipped"
        );
    }
    let horizons: Vec<u32> = (config.min_horizon..=config.max_horizon).collect();
    let batches: Vec<SimulationBatch> = horizons
        .iter()
        .map(|&h| model.run_batch(h, &model.start_months(h)))
        .collect();

    let summaries = batches
        .iter()
        .map(|batch| summarize(batch, &config.aggregation, config.include_audit))
        .collect();
    let combined = combined_table(&batches);
    let combined_stats = ending_value_stats(&combined);
    let static_values = static_ending_values(
        model.table(),
        model.plan(),
        &model.start_months(config.min_horizon),
        &horizons,
    );
    let exclusions = summarize_exclusions(&batches, outside_table);

    info!(
        horizons = horizons.len(),
        excluded = exclusions.total,
        "study complete"
    );

    Ok(StudyReport {
        bucket_family: model.table().buckets().family().to_string(),
        buckets: model.table().buckets().buckets().to_vec(),
        first_month: model.table().first_month(),
        month_count: model.table().len(),
        cost_matrix: model.matrix().rows(),
        glide_plan: model.plan().entries().to_vec(),
        horizons: summaries,
        combined,
        combined_stats,
        static_ending_values: static_values,
        exclusions,
    })
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
