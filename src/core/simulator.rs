use super::error::{GlidepathError, Result};
use super::factors::ReturnFactorTable;
use super::selector::{AllocationSelector, remaining_horizon};
use super::types::{
    AllocationPath, MONTHS_PER_YEAR, MonthIndex, PathFailure, PathRecord, SeedPolicy,
};

/// Walks one path forward year by year.
#[derive(Debug, Clone, Copy)]
pub struct PathSimulator<'a> {
    table: &'a ReturnFactorTable,
    selector: AllocationSelector<'a>,
    seed_policy: SeedPolicy,
}

impl<'a> PathSimulator<'a> {
    pub fn new(
        table: &'a ReturnFactorTable,
        selector: AllocationSelector<'a>,
        seed_policy: SeedPolicy,
    ) -> Self {
        Self {
            table,
            selector,
            seed_policy,
        }
    }

    /// Month whose one-year factor is applied in `year` (>= 2), or `None`
    /// past the last representable month.
    pub fn month_for_year(start_month: MonthIndex, year: u32) -> Option<MonthIndex> {
        let offset = year.checked_sub(2)?.checked_mul(MONTHS_PER_YEAR)?;
        start_month.checked_add(offset)
    }

    fn seed_value(&self, horizon: u32) -> Result<f64> {
        match self.seed_policy {
            SeedPolicy::Unit => Ok(1.0),
            SeedPolicy::LowestCost => self
                .selector
                .plan()
                .entry(horizon)
                .and_then(|e| e.lowest_cost_value)
                .ok_or(GlidepathError::UnresolvedAllocation {
                    horizon,
                    equity_weight: None,
                }),
        }
    }

    /// Produces a path of exactly `horizon` records, or the failure that
    /// stopped it along with the last year that was completed.
    pub fn simulate(
        &self,
        start_month: MonthIndex,
        horizon: u32,
    ) -> std::result::Result<AllocationPath, PathFailure> {
        let fail = |truncated_at_year: Option<u32>, error: GlidepathError| PathFailure {
            start_month,
            horizon,
            truncated_at_year,
            error,
        };
        if horizon == 0 {
            return Err(fail(
                None,
                GlidepathError::InvalidConfig("horizon must be at least 1".to_string()),
            ));
        }

        let seed = self.seed_value(horizon).map_err(|e| fail(None, e))?;
        let max_years = self.table.len() / MONTHS_PER_YEAR as usize + 2;
        let mut records = Vec::with_capacity((horizon as usize).min(max_years));
        records.push(PathRecord {
            year: 1,
            bucket: None,
            factor: 1.0,
            value: seed,
        });
        if horizon == 1 {
            return Ok(AllocationPath {
                start_month,
                horizon,
                records,
            });
        }

        let mut bucket = self
            .selector
            .initial(horizon)
            .map_err(|e| fail(Some(1), e))?;
        let mut value = seed;
        for year in 2..=horizon {
            if year >= 3 {
                bucket = self
                    .selector
                    .next(bucket, value, remaining_horizon(horizon, year));
            }
            let looked_up = match Self::month_for_year(start_month, year) {
                Some(month) => self.table.factor(month, bucket, start_month, year),
                None => Err(self.table.out_of_range(start_month, year, MonthIndex::MAX)),
            };
            let factor = looked_up.map_err(|e| fail(Some(year - 1), e))?;
            value *= factor;
            records.push(PathRecord {
                year,
                bucket: Some(bucket),
                factor,
                value,
            });
        }

        Ok(AllocationPath {
            start_month,
            horizon,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matrix::{CostMatrix, GlidePlan};
    use crate::core::types::{Bucket, BucketSet};
    use proptest::collection::vec;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-12;

    fn table(labels: &[&str], rows: Vec<Vec<f64>>) -> ReturnFactorTable {
        let buckets = BucketSet::from_labels(labels).expect("labels");
        ReturnFactorTable::new(buckets, 0, rows).expect("table")
    }

    fn unit_simulator<'a>(
        t: &'a ReturnFactorTable,
        m: &'a CostMatrix,
        plan: &'a GlidePlan,
    ) -> PathSimulator<'a> {
        let selector = AllocationSelector::new(m, plan, 1);
        PathSimulator::new(t, selector, SeedPolicy::Unit)
    }

    fn b(pct: u8) -> Bucket {
        Bucket::new(pct).expect("bucket")
    }

    #[test]
    fn two_bucket_horizon_two_applies_initial_factor() {
        let t = table(&["LBM 10E", "LBM 100F"], vec![vec![1.05, 1.0]; 12]);
        let m = CostMatrix::build(&t, 2).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        let sim = unit_simulator(&t, &m, &plan);

        let path = sim.simulate(0, 2).expect("path");
        assert_eq!(path.records.len(), 2);
        assert_eq!(
            path.records[0],
            PathRecord {
                year: 1,
                bucket: None,
                factor: 1.0,
                value: 1.0,
            }
        );
        assert_eq!(path.records[1].bucket, Some(b(10)));
        assert_eq!(path.records[1].factor, 1.05);
        assert!((path.records[1].value - 1.05).abs() < EPS);
    }

    #[test]
    fn horizon_one_is_just_the_seed() {
        let t = table(&["LBM 100E"], vec![vec![2.0]]);
        let m = CostMatrix::build(&t, 1).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        let sim = unit_simulator(&t, &m, &plan);
        let path = sim.simulate(0, 1).expect("path");
        assert_eq!(path.records.len(), 1);
        assert_eq!(path.terminal_value(), 1.0);
    }

    #[test]
    fn out_of_range_month_fails_with_truncation_year() {
        let t = table(&["LBM 100E", "LBM 100F"], vec![vec![1.1, 1.0]; 24]);
        let m = CostMatrix::build(&t, 3).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        let sim = unit_simulator(&t, &m, &plan);

        // last valid start for horizon 3 is month 11
        assert!(sim.simulate(11, 3).is_ok());
        let failure = sim.simulate(23, 3).expect_err("month 35 missing");
        assert_eq!(failure.start_month, 23);
        assert_eq!(failure.horizon, 3);
        assert_eq!(failure.truncated_at_year, Some(2));
        let GlidepathError::OutOfRange { month, year, .. } = failure.error else {
            panic!("expected out-of-range, got {:?}", failure.error);
        };
        assert_eq!((month, year), (35, 3));
    }

    #[test]
    fn month_for_year_stops_at_the_last_representable_month() {
        assert_eq!(PathSimulator::month_for_year(10, 2), Some(10));
        assert_eq!(PathSimulator::month_for_year(10, 3), Some(22));
        assert_eq!(PathSimulator::month_for_year(u32::MAX - 5, 3), None);
        assert_eq!(PathSimulator::month_for_year(0, u32::MAX), None);
        assert_eq!(PathSimulator::month_for_year(0, 1), None);
    }

    #[test]
    fn paths_near_the_top_of_the_month_range_fail_instead_of_wrapping() {
        let buckets = BucketSet::from_labels(&["LBM 100E", "LBM 100F"]).expect("labels");
        let first = u32::MAX - 29;
        let t = ReturnFactorTable::new(buckets, first, vec![vec![1.1, 1.0]; 30]).expect("table");
        assert_eq!(t.last_month(), u32::MAX);
        let m = CostMatrix::build(&t, 4).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        let sim = unit_simulator(&t, &m, &plan);

        assert!(sim.simulate(first, 4).is_ok());
        let failure = sim
            .simulate(u32::MAX - 5, 4)
            .expect_err("year 3 month overflows");
        assert_eq!(failure.truncated_at_year, Some(2));
        let GlidepathError::OutOfRange { year, .. } = failure.error else {
            panic!("expected out-of-range, got {:?}", failure.error);
        };
        assert_eq!(year, 3);
    }

    #[test]
    fn de_risks_once_value_covers_a_safer_bucket() {
        // Equity booms in the first year of every window; fixed income is flat.
        // From a seed of 1.0 a single good year already covers the cost of
        // holding fixed income for the rest of the path.
        let mut rows = Vec::new();
        for month in 0..36 {
            let equity = if month < 12 { 1.5 } else { 1.2 };
            rows.push(vec![equity, 1.0]);
        }
        let t = table(&["LBM 100E", "LBM 100F"], rows);
        let m = CostMatrix::build(&t, 4).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        assert_eq!(plan.entry(4).unwrap().bucket, Some(Bucket::ALL_EQUITY));

        let sim = unit_simulator(&t, &m, &plan);
        let path = sim.simulate(0, 4).expect("path");
        let buckets: Vec<_> = path.records.iter().map(|r| r.bucket).collect();
        assert_eq!(
            buckets,
            vec![
                None,
                Some(Bucket::ALL_EQUITY),
                Some(Bucket::FIXED_INCOME),
                Some(Bucket::FIXED_INCOME),
            ]
        );
        assert!((path.terminal_value() - 1.5).abs() < EPS);
    }

    #[test]
    fn lowest_cost_seed_uses_plan_value() {
        let t = table(&["LBM 10E", "LBM 100F"], vec![vec![1.05, 1.0]; 12]);
        let m = CostMatrix::build(&t, 2).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        let sim = PathSimulator::new(
            &t,
            AllocationSelector::new(&m, &plan, 1),
            SeedPolicy::LowestCost,
        );
        let path = sim.simulate(3, 2).expect("path");
        let seed = plan.entry(2).unwrap().lowest_cost_value.unwrap();
        assert_eq!(path.records[0].value, seed);
        assert!((path.terminal_value() - seed * 1.05).abs() < EPS);
    }

    #[test]
    fn unresolved_initial_allocation_fails_path() {
        let t = table(&["LBM 25E", "LBM 100F"], vec![vec![1.2, 0.9]; 12]);
        let m = CostMatrix::build(&t, 2).expect("matrix");
        let plan = GlidePlan::from_matrix(&m, true);
        let sim = unit_simulator(&t, &m, &plan);
        let failure = sim
            .simulate(0, 2)
            .expect_err("0.25 does not round to a bucket");
        assert_eq!(failure.error.kind(), "unresolved-allocation");
        assert_eq!(failure.truncated_at_year, Some(1));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_paths_have_full_length_unit_seed_and_ratchet(
            equity in vec(0.6f64..1.6, 120),
            balanced in vec(0.8f64..1.3, 120),
            fixed in vec(0.95f64..1.08, 120),
            horizon in 1u32..9,
            start in 0u32..24
        ) {
            let rows: Vec<Vec<f64>> = (0..120)
                .map(|i| vec![equity[i], balanced[i], fixed[i]])
                .collect();
            let t = table(&["LBM 100E", "LBM 50E", "LBM 100F"], rows);
            let m = CostMatrix::build(&t, 9).expect("matrix");
            let plan = GlidePlan::from_matrix(&m, true);
            let sim = unit_simulator(&t, &m, &plan);

            let path = sim.simulate(start, horizon).expect("start + 12 * 7 < 120");
            prop_assert_eq!(path.records.len(), horizon as usize);
            prop_assert_eq!(path.records[0].value, 1.0);

            for pair in path.records.windows(2) {
                let (prev, cur) = (&pair[0], &pair[1]);
                prop_assert_eq!(cur.value, prev.value * cur.factor);
                if cur.year > 2 {
                    prop_assert!(cur.bucket <= prev.bucket);
                }
            }
        }
    }
}
