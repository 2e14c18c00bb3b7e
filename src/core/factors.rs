use std::io::Read;
use std::path::Path;

use tracing::debug;

use super::error::{GlidepathError, Result};
use super::types::{Bucket, BucketSet, MonthIndex};

/// One-year growth factors per starting month and bucket.
///
/// Rows are addressed by an explicit month index; the table covers the
/// contiguous range `first_month..first_month + len`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnFactorTable {
    buckets: BucketSet,
    first_month: MonthIndex,
    // row-major: rows[month offset][bucket column]
    rows: Vec<Vec<f64>>,
}

impl ReturnFactorTable {
    pub fn new(buckets: BucketSet, first_month: MonthIndex, rows: Vec<Vec<f64>>) -> Result<Self> {
        if rows.is_empty() {
            return Err(GlidepathError::EmptyTable);
        }
        if month_at(first_month, rows.len() - 1).is_none() {
            return Err(GlidepathError::MonthOverflow {
                first_month,
                rows: rows.len(),
            });
        }
        let labels = buckets.labels();
        for (offset, row) in rows.iter().enumerate() {
            let month = first_month + offset as u32;
            if row.len() != buckets.len() {
                return Err(GlidepathError::RowWidthMismatch {
                    month,
                    expected: buckets.len(),
                    actual: row.len(),
                });
            }
            if let Some(col) = row.iter().position(|v| !v.is_finite()) {
                return Err(GlidepathError::NonNumericFactor {
                    column: labels[col].clone(),
                    month,
                });
            }
        }
        Ok(Self {
            buckets,
            first_month,
            rows,
        })
    }

    /// Builds a table from explicitly keyed rows, checking that the month
    /// indices are contiguous and ascending.
    pub fn from_keyed_rows(
        buckets: BucketSet,
        keyed: Vec<(MonthIndex, Vec<f64>)>,
    ) -> Result<Self> {
        let first_month = keyed
            .first()
            .map(|(m, _)| *m)
            .ok_or(GlidepathError::EmptyTable)?;
        let count = keyed.len();
        let mut rows = Vec::with_capacity(count);
        for (offset, (month, row)) in keyed.into_iter().enumerate() {
            let Some(expected) = month_at(first_month, offset) else {
                return Err(GlidepathError::MonthOverflow {
                    first_month,
                    rows: count,
                });
            };
            if month != expected {
                return Err(GlidepathError::NonContiguousMonths {
                    expected,
                    found: month,
                });
            }
            rows.push(row);
        }
        Self::new(buckets, first_month, rows)
    }

    /// Reads a CSV with one column per bucket label and an optional leading
    /// `month` (or `index`) column. Without it months are numbered from 0.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let has_month = headers
            .get(0)
            .map(|h| h.eq_ignore_ascii_case("month") || h.eq_ignore_ascii_case("index"))
            .unwrap_or(false);
        let label_start = usize::from(has_month);
        let labels: Vec<&str> = headers.iter().skip(label_start).collect();
        let buckets = BucketSet::from_labels(&labels)?;

        let mut keyed = Vec::new();
        for (row_idx, record) in rdr.records().enumerate() {
            let record = record?;
            let month = if has_month {
                let raw = record.get(0).unwrap_or("");
                raw.parse::<MonthIndex>().map_err(|_| {
                    GlidepathError::InvalidConfig(format!(
                        "month column value {raw:?} on data row {} is not a non-negative integer",
                        row_idx + 1
                    ))
                })?
            } else {
                let Ok(month) = MonthIndex::try_from(row_idx) else {
                    return Err(GlidepathError::MonthOverflow {
                        first_month: 0,
                        rows: row_idx + 1,
                    });
                };
                month
            };
            let mut row = Vec::with_capacity(labels.len());
            for (col, label) in labels.iter().enumerate() {
                let raw = record.get(col + label_start).unwrap_or("");
                let value = raw.parse::<f64>().map_err(|_| GlidepathError::NonNumericFactor {
                    column: (*label).to_string(),
                    month,
                })?;
                row.push(value);
            }
            keyed.push((month, row));
        }
        debug!(
            rows = keyed.len(),
            buckets = buckets.len(),
            "parsed factor CSV"
        );
        Self::from_keyed_rows(buckets, keyed)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn buckets(&self) -> &BucketSet {
        &self.buckets
    }

    pub fn first_month(&self) -> MonthIndex {
        self.first_month
    }

    /// Never overflows: construction rejects tables that run past `u32::MAX`.
    pub fn last_month(&self) -> MonthIndex {
        self.first_month + (self.rows.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains_month(&self, month: MonthIndex) -> bool {
        month >= self.first_month && month <= self.last_month()
    }

    /// Factor for `bucket` at `month`, or `None` when the month is outside
    /// the table or the bucket is not one of its columns.
    pub fn get(&self, month: MonthIndex, bucket: Bucket) -> Option<f64> {
        if !self.contains_month(month) {
            return None;
        }
        let col = self.buckets.position(bucket)?;
        Some(self.rows[(month - self.first_month) as usize][col])
    }

    /// Like [`get`](Self::get) but reports a missing month as `OutOfRange`
    /// for the path identified by `start_month` and `year`.
    pub fn factor(
        &self,
        month: MonthIndex,
        bucket: Bucket,
        start_month: MonthIndex,
        year: u32,
    ) -> Result<f64> {
        if !self.contains_month(month) {
            return Err(self.out_of_range(start_month, year, month));
        }
        self.get(month, bucket)
            .ok_or_else(|| GlidepathError::MissingColumn(bucket.label(self.buckets.family())))
    }

    pub fn out_of_range(
        &self,
        start_month: MonthIndex,
        year: u32,
        month: MonthIndex,
    ) -> GlidepathError {
        GlidepathError::OutOfRange {
            start_month,
            year,
            month,
            first_month: self.first_month,
            last_month: self.last_month(),
        }
    }

    /// Column for one bucket in month order.
    pub fn column(&self, bucket: Bucket) -> Option<Vec<f64>> {
        let col = self.buckets.position(bucket)?;
        Some(self.rows.iter().map(|row| row[col]).collect())
    }

    /// Restricts the table to `subset`, in the order given.
    pub fn select(&self, subset: &[Bucket]) -> Result<Self> {
        let family = self.buckets.family();
        let mut cols = Vec::with_capacity(subset.len());
        for bucket in subset {
            let col = self
                .buckets
                .position(*bucket)
                .ok_or_else(|| GlidepathError::MissingColumn(bucket.label(family)))?;
            cols.push(col);
        }
        let buckets = BucketSet::new(family, subset.to_vec())?;
        let rows = self
            .rows
            .iter()
            .map(|row| cols.iter().map(|&c| row[c]).collect())
            .collect();
        Self::new(buckets, self.first_month, rows)
    }

    /// Derives every bucket at multiples of `step_pct` as a linear mix of the
    /// `100E` and `100F` columns. Columns come out ordered from all-equity
    /// down to fixed income.
    pub fn with_blended_buckets(&self, step_pct: u8) -> Result<Self> {
        if step_pct == 0 || step_pct > 100 || 100 % step_pct != 0 {
            return Err(GlidepathError::InvalidConfig(format!(
                "blend step {step_pct} must divide 100"
            )));
        }
        let family = self.buckets.family();
        let equity = self
            .column(Bucket::ALL_EQUITY)
            .ok_or_else(|| GlidepathError::MissingColumn(Bucket::ALL_EQUITY.label(family)))?;
        let fixed = self
            .column(Bucket::FIXED_INCOME)
            .ok_or_else(|| GlidepathError::MissingColumn(Bucket::FIXED_INCOME.label(family)))?;

        let mut buckets = Vec::new();
        let mut pct = 100u8;
        loop {
            buckets.push(Bucket::new(pct)?);
            if pct == 0 {
                break;
            }
            pct -= step_pct;
        }

        let rows = equity
            .iter()
            .zip(&fixed)
            .map(|(e, f)| {
                buckets
                    .iter()
                    .map(|b| match b.equity_pct() {
                        100 => *e,
                        0 => *f,
                        _ => b.weight() * e + (1.0 - b.weight()) * f,
                    })
                    .collect()
            })
            .collect();

        Self::new(BucketSet::new(family, buckets)?, self.first_month, rows)
    }
}

/// Month of the row `offset` rows after `first_month`, if representable.
fn month_at(first_month: MonthIndex, offset: usize) -> Option<MonthIndex> {
    u32::try_from(offset)
        .ok()
        .and_then(|o| first_month.checked_add(o))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn endpoints_table() -> ReturnFactorTable {
        let buckets = BucketSet::from_labels(&["LBM 100E", "LBM 100F"]).expect("labels");
        ReturnFactorTable::new(
            buckets,
            0,
            vec![vec![1.20, 1.02], vec![0.80, 1.04], vec![1.10, 1.00]],
        )
        .expect("valid table")
    }

    #[test]
    fn factor_lookup_uses_month_index_not_row_position() {
        let buckets = BucketSet::from_labels(&["LBM 100E"]).expect("labels");
        let table = ReturnFactorTable::from_keyed_rows(
            buckets,
            vec![(5, vec![1.1]), (6, vec![1.2]), (7, vec![1.3])],
        )
        .expect("valid table");
        assert_eq!(table.first_month(), 5);
        assert_eq!(table.last_month(), 7);
        assert_eq!(table.get(6, Bucket::ALL_EQUITY), Some(1.2));
        assert_eq!(table.get(4, Bucket::ALL_EQUITY), None);

        let err = table
            .factor(8, Bucket::ALL_EQUITY, 5, 4)
            .expect_err("month 8 is past the end");
        assert_eq!(err.kind(), "out-of-range");
    }

    #[test]
    fn rejects_gaps_in_month_index() {
        let buckets = BucketSet::from_labels(&["LBM 100E"]).expect("labels");
        let rows = vec![(0, vec![1.0]), (2, vec![1.0])];
        let err = ReturnFactorTable::from_keyed_rows(buckets, rows).expect_err("gap");
        let GlidepathError::NonContiguousMonths { expected, found } = err else {
            panic!("expected a month gap, got {err:?}");
        };
        assert_eq!((expected, found), (1, 2));
    }

    #[test]
    fn rejects_non_finite_and_short_rows() {
        let buckets = BucketSet::from_labels(&["LBM 100E", "LBM 100F"]).expect("labels");
        let err = ReturnFactorTable::new(buckets.clone(), 0, vec![vec![1.0, f64::NAN]])
            .expect_err("nan");
        assert_eq!(err.kind(), "non-numeric-factor");
        assert!(err.to_string().contains("LBM 100F"));

        let err = ReturnFactorTable::new(buckets, 0, vec![vec![1.0]]).expect_err("short");
        assert_eq!(err.kind(), "row-width-mismatch");
    }

    #[test]
    fn blending_produces_linear_mixes() {
        let table = endpoints_table().with_blended_buckets(10).expect("blend");
        assert_eq!(table.buckets().len(), 11);
        assert_eq!(table.buckets().buckets()[0], Bucket::ALL_EQUITY);
        assert_eq!(table.buckets().buckets()[10], Bucket::FIXED_INCOME);

        let b70 = Bucket::new(70).unwrap();
        let expected = 0.7 * 0.80 + 0.3 * 1.04;
        assert!((table.get(1, b70).unwrap() - expected).abs() < EPS);
        assert_eq!(table.get(0, Bucket::ALL_EQUITY), Some(1.20));
        assert_eq!(table.get(0, Bucket::FIXED_INCOME), Some(1.02));
    }

    #[test]
    fn blending_requires_endpoints_and_a_divisor_step() {
        let buckets = BucketSet::from_labels(&["LBM 100E"]).expect("labels");
        let table = ReturnFactorTable::new(buckets, 0, vec![vec![1.0]]).expect("table");
        let err = table.with_blended_buckets(10).expect_err("no 100F");
        assert_eq!(err.kind(), "missing-column");

        let err = endpoints_table().with_blended_buckets(30).expect_err("step");
        assert_eq!(err.kind(), "invalid-config");
    }

    #[test]
    fn select_reorders_and_restricts_columns() {
        let table = endpoints_table().with_blended_buckets(25).expect("blend");
        let subset = [Bucket::FIXED_INCOME, Bucket::new(50).unwrap()];
        let narrowed = table.select(&subset).expect("subset");
        assert_eq!(narrowed.buckets().buckets(), &subset);
        assert_eq!(narrowed.get(2, Bucket::ALL_EQUITY), None);

        let err = table.select(&[Bucket::new(10).unwrap()]).expect_err("absent");
        assert_eq!(err.kind(), "missing-column");
    }

    #[test]
    fn csv_reader_handles_optional_month_column() {
        let with_month = "month,LBM 100E,LBM 100F\n10,1.1,1.0\n11,0.9,1.01\n";
        let table = ReturnFactorTable::from_csv_reader(with_month.as_bytes()).expect("csv");
        assert_eq!(table.first_month(), 10);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(11, Bucket::FIXED_INCOME), Some(1.01));

        let without_month = "LBM 60E, LBM 100F\n1.05,1.01\n";
        let table = ReturnFactorTable::from_csv_reader(without_month.as_bytes()).expect("csv");
        assert_eq!(table.first_month(), 0);
        assert_eq!(table.get(0, Bucket::new(60).unwrap()), Some(1.05));
    }

    #[test]
    fn csv_reader_rejects_text_in_factor_cells() {
        let data = "LBM 100E\n1.1\nn/a\n";
        let err = ReturnFactorTable::from_csv_reader(data.as_bytes()).expect_err("text");
        let GlidepathError::NonNumericFactor { month, .. } = &err else {
            panic!("expected a non-numeric factor, got {err:?}");
        };
        assert_eq!(*month, 1);
    }

    #[test]
    fn rejects_tables_that_run_past_the_last_month() {
        let buckets = BucketSet::from_labels(&["LBM 100E", "LBM 100F"]).expect("labels");
        let err = ReturnFactorTable::new(buckets.clone(), u32::MAX - 2, vec![vec![1.1, 1.0]; 10])
            .expect_err("overflow");
        assert_eq!(err.kind(), "month-overflow");

        let keyed = vec![(u32::MAX, vec![1.1, 1.0]), (0, vec![1.1, 1.0])];
        let err = ReturnFactorTable::from_keyed_rows(buckets.clone(), keyed).expect_err("wrap");
        let GlidepathError::MonthOverflow { first_month, rows } = err else {
            panic!("expected a month overflow, got {err:?}");
        };
        assert_eq!((first_month, rows), (u32::MAX, 2));

        let table = ReturnFactorTable::new(buckets, u32::MAX - 2, vec![vec![1.1, 1.0]; 3])
            .expect("ends on the last month");
        assert_eq!(table.last_month(), u32::MAX);
        assert!(table.contains_month(u32::MAX));
        assert_eq!(table.get(u32::MAX, Bucket::ALL_EQUITY), Some(1.1));
    }

    #[test]
    fn csv_months_near_the_top_of_the_range_load_and_stop_there() {
        let first = u32::MAX - 1;
        let data = format!("month,LBM 100E\n{first},1.1\n{},1.2\n", u32::MAX);
        let table = ReturnFactorTable::from_csv_reader(data.as_bytes()).expect("csv");
        assert_eq!(table.last_month(), u32::MAX);

        let err = table
            .factor(u32::MAX, Bucket::FIXED_INCOME, first, 2)
            .expect_err("no fixed income column");
        assert_eq!(err.kind(), "missing-column");
    }
}
