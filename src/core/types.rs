use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::GlidepathError;

pub type MonthIndex = u32;

/// Months between consecutive annual factors of one path.
pub const MONTHS_PER_YEAR: u32 = 12;

/// A discrete equity/fixed-income mix, identified by its equity percentage.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Bucket {
    equity_pct: u8,
}

impl Bucket {
    pub const FIXED_INCOME: Bucket = Bucket { equity_pct: 0 };
    pub const ALL_EQUITY: Bucket = Bucket { equity_pct: 100 };

    pub fn new(equity_pct: u8) -> Result<Self, GlidepathError> {
        if equity_pct > 100 {
            return Err(GlidepathError::InvalidBucketName {
                label: format!("{equity_pct}E"),
                reason: "equity percentage must be between 0 and 100".to_string(),
            });
        }
        Ok(Self { equity_pct })
    }

    pub fn equity_pct(self) -> u8 {
        self.equity_pct
    }

    pub fn weight(self) -> f64 {
        self.equity_pct as f64 / 100.0
    }

    pub fn label(self, family: &str) -> String {
        format!("{family} {self}")
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.equity_pct == 0 {
            write!(f, "100F")
        } else {
            write!(f, "{}E", self.equity_pct)
        }
    }
}

impl From<Bucket> for String {
    fn from(value: Bucket) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Bucket {
    type Error = GlidepathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for Bucket {
    type Err = GlidepathError;

    /// Accepts the weight token alone (`70E`, `100F`) or a full label
    /// (`LBM 70E`); the family part is ignored here.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.split_whitespace().last().unwrap_or("");
        parse_weight_token(s, token)
    }
}

fn parse_weight_token(label: &str, token: &str) -> Result<Bucket, GlidepathError> {
    let invalid = |reason: &str| GlidepathError::InvalidBucketName {
        label: label.to_string(),
        reason: reason.to_string(),
    };

    if let Some(digits) = token.strip_suffix('F') {
        return match digits {
            "100" => Ok(Bucket::FIXED_INCOME),
            _ => Err(invalid("only 100F is a valid fixed-income bucket")),
        };
    }

    let digits = token
        .strip_suffix('E')
        .ok_or_else(|| invalid("expected an <n>E or 100F suffix"))?;
    let pct = digits
        .parse::<u8>()
        .map_err(|_| invalid("equity percentage must be an integer"))?;
    if pct > 100 {
        return Err(invalid("equity percentage must be between 0 and 100"));
    }
    Ok(Bucket { equity_pct: pct })
}

/// Splits a full column label such as `LBM 70E` into its family and bucket.
pub fn parse_bucket_label(label: &str) -> Result<(String, Bucket), GlidepathError> {
    let trimmed = label.trim();
    let (family, token) = trimmed
        .rsplit_once(' ')
        .ok_or_else(|| GlidepathError::InvalidBucketName {
            label: label.to_string(),
            reason: "expected \"<family> <weight>\"".to_string(),
        })?;
    let family = family.trim();
    if family.is_empty() {
        return Err(GlidepathError::InvalidBucketName {
            label: label.to_string(),
            reason: "family name is empty".to_string(),
        });
    }
    let bucket = parse_weight_token(label, token)?;
    Ok((family.to_string(), bucket))
}

/// The buckets of one factor table, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSet {
    family: String,
    buckets: Vec<Bucket>,
}

impl BucketSet {
    pub fn new(family: impl Into<String>, buckets: Vec<Bucket>) -> Result<Self, GlidepathError> {
        let family = family.into();
        if buckets.is_empty() {
            return Err(GlidepathError::InvalidConfig(
                "bucket set must not be empty".to_string(),
            ));
        }
        for (idx, bucket) in buckets.iter().enumerate() {
            if buckets[..idx].contains(bucket) {
                return Err(GlidepathError::DuplicateBucket {
                    label: bucket.label(&family),
                });
            }
        }
        Ok(Self { family, buckets })
    }

    /// Parses column labels; every column must share the same family.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Result<Self, GlidepathError> {
        let mut family: Option<String> = None;
        let mut buckets = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            let (label_family, bucket) = parse_bucket_label(label)?;
            match &family {
                None => family = Some(label_family),
                Some(expected) if *expected != label_family => {
                    return Err(GlidepathError::MixedBucketFamilies {
                        expected: expected.clone(),
                        label: label.to_string(),
                    });
                }
                Some(_) => {}
            }
            buckets.push(bucket);
        }
        let family = family.ok_or_else(|| {
            GlidepathError::InvalidConfig("factor table needs at least one bucket column".into())
        })?;
        Self::new(family, buckets)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn position(&self, bucket: Bucket) -> Option<usize> {
        self.buckets.iter().position(|b| *b == bucket)
    }

    pub fn contains(&self, bucket: Bucket) -> bool {
        self.position(bucket).is_some()
    }

    pub fn most_conservative(&self) -> Bucket {
        self.buckets
            .iter()
            .copied()
            .min()
            .unwrap_or(Bucket::FIXED_INCOME)
    }

    pub fn labels(&self) -> Vec<String> {
        self.buckets.iter().map(|b| b.label(&self.family)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRecord {
    pub year: u32,
    pub bucket: Option<Bucket>,
    pub factor: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPath {
    pub start_month: MonthIndex,
    pub horizon: u32,
    pub records: Vec<PathRecord>,
}

impl AllocationPath {
    pub fn terminal_value(&self) -> f64 {
        self.records.last().map(|r| r.value).unwrap_or(0.0)
    }

    pub fn last_non_zero_value(&self) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .map(|r| r.value)
            .find(|v| *v != 0.0)
    }
}

/// A path that could not be completed; `truncated_at_year` is the last year
/// that was produced before the failure, if any.
#[derive(Debug)]
pub struct PathFailure {
    pub start_month: MonthIndex,
    pub horizon: u32,
    pub truncated_at_year: Option<u32>,
    pub error: GlidepathError,
}

#[derive(Debug)]
pub struct SimulationBatch {
    pub horizon: u32,
    pub paths: Vec<AllocationPath>,
    pub failures: Vec<PathFailure>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedPolicy {
    /// Every path starts at 1.0.
    #[default]
    Unit,
    /// Paths start at the glide plan's lowest cost value for their horizon.
    #[serde(alias = "lowestCost", alias = "lowest_cost")]
    LowestCost,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AggregationPolicy {
    /// Added to the year-1 total of every horizon summary.
    pub year_one_total_offset: Option<f64>,
    /// Number of latest starting months left out of the horizon-1 summary.
    pub unit_horizon_trailing_drop: Option<usize>,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            year_one_total_offset: Some(1.0),
            unit_horizon_trailing_drop: Some(12),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub min_horizon: u32,
    pub max_horizon: u32,
    /// Inclusive starting-month range; `None` means every month with a full window.
    pub start_months: Option<(MonthIndex, MonthIndex)>,
    pub buckets: Option<Vec<Bucket>>,
    pub blend_step_pct: Option<u8>,
    pub rounding_precision: u32,
    pub seed_policy: SeedPolicy,
    pub no_decrease_rule: bool,
    pub aggregation: AggregationPolicy,
    pub parallel: bool,
    pub include_audit: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_horizon: 1,
            max_horizon: 41,
            start_months: None,
            buckets: None,
            blend_step_pct: None,
            rounding_precision: 1,
            seed_policy: SeedPolicy::Unit,
            no_decrease_rule: true,
            aggregation: AggregationPolicy::default(),
            parallel: true,
            include_audit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostMatrixRow {
    pub bucket: Bucket,
    pub min_factors: Vec<Option<f64>>,
    pub costs: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlidePlanEntry {
    pub horizon: u32,
    pub bucket: Option<Bucket>,
    pub equity_weight: Option<f64>,
    pub lowest_cost_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedPath {
    pub horizon: u32,
    pub start_month: MonthIndex,
    pub kind: &'static str,
    pub truncated_at_year: Option<u32>,
    pub message: String,
}

impl From<&PathFailure> for ExcludedPath {
    fn from(value: &PathFailure) -> Self {
        Self {
            horizon: value.horizon,
            start_month: value.start_month,
            kind: value.error.kind(),
            truncated_at_year: value.truncated_at_year,
            message: value.error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRow {
    pub start_month: MonthIndex,
    pub year: u32,
    pub bucket: Option<Bucket>,
    pub factor: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMonthValues {
    pub start_month: MonthIndex,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMonthValue {
    pub start_month: MonthIndex,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizonSummary {
    pub horizon: u32,
    pub paths_simulated: usize,
    pub paths_aggregated: usize,
    pub year_totals: Vec<f64>,
    pub weighted_allocation: Vec<f64>,
    pub last_non_zero: Vec<StartMonthValue>,
    pub ending_values: Vec<StartMonthValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<Vec<AuditRow>>,
    pub excluded: Vec<ExcludedPath>,
}

/// Per starting month, one column per horizon in range.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizonTable {
    pub horizons: Vec<u32>,
    pub rows: Vec<StartMonthValues>,
    pub normalized: Vec<StartMonthValues>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndingValueStats {
    pub lowest_average: Option<f64>,
    pub median_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionSummary {
    pub total: usize,
    pub out_of_range: usize,
    pub unresolved_allocation: usize,
    pub other: usize,
    /// Requested starting months that fall outside the factor table.
    pub start_months_outside_table: u64,
    pub paths: Vec<ExcludedPath>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyReport {
    pub bucket_family: String,
    pub buckets: Vec<Bucket>,
    pub first_month: MonthIndex,
    pub month_count: usize,
    pub cost_matrix: Vec<CostMatrixRow>,
    pub glide_plan: Vec<GlidePlanEntry>,
    pub horizons: Vec<HorizonSummary>,
    pub combined: HorizonTable,
    pub combined_stats: EndingValueStats,
    pub static_ending_values: HorizonTable,
    pub exclusions: ExclusionSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equity_and_fixed_income_labels() {
        let (family, bucket) = parse_bucket_label("LBM 70E").expect("valid label");
        assert_eq!(family, "LBM");
        assert_eq!(bucket.equity_pct(), 70);
        assert!((bucket.weight() - 0.7).abs() < 1e-12);

        let (_, fixed) = parse_bucket_label("LBM 100F").expect("valid label");
        assert_eq!(fixed, Bucket::FIXED_INCOME);
        assert_eq!(fixed.label("LBM"), "LBM 100F");
        assert_eq!(Bucket::ALL_EQUITY.label("LBM"), "LBM 100E");
    }

    #[test]
    fn rejects_malformed_labels() {
        for label in ["70E", "LBM 70", "LBM 7.5E", "LBM 110E", "LBM 30F", " 40E"] {
            let err = parse_bucket_label(label).expect_err(label);
            assert_eq!(err.kind(), "invalid-bucket-name", "label {label}");
        }
    }

    #[test]
    fn bucket_from_str_accepts_short_and_full_forms() {
        let forty = Bucket::new(40).unwrap();
        assert_eq!("40E".parse::<Bucket>().expect("short"), forty);
        assert_eq!("LBM 40E".parse::<Bucket>().expect("full"), forty);
        assert_eq!(
            "100F".parse::<Bucket>().expect("fixed"),
            Bucket::FIXED_INCOME
        );
        assert!("abc".parse::<Bucket>().is_err());
    }

    #[test]
    fn bucket_set_rejects_mixed_families_and_duplicates() {
        let err = BucketSet::from_labels(&["LBM 100E", "XYZ 100F"]).expect_err("mixed");
        assert_eq!(err.kind(), "mixed-bucket-families");

        let err = BucketSet::from_labels(&["LBM 50E", "LBM 50E"]).expect_err("dup");
        assert_eq!(err.kind(), "duplicate-bucket");
    }

    #[test]
    fn bucket_set_reports_most_conservative_bucket() {
        let set = BucketSet::from_labels(&["LBM 100E", "LBM 30E", "LBM 60E"]).expect("valid");
        assert_eq!(set.most_conservative().equity_pct(), 30);
        assert_eq!(set.labels(), vec!["LBM 100E", "LBM 30E", "LBM 60E"]);
    }

    #[test]
    fn bucket_serializes_as_weight_token() {
        let buckets = vec![Bucket::new(20).unwrap(), Bucket::FIXED_INCOME];
        let json = serde_json::to_string(&buckets).expect("serialize");
        assert_eq!(json, r#"["20E","100F"]"#);
        let back: Vec<Bucket> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back[0].equity_pct(), 20);
    }

    #[test]
    fn last_non_zero_skips_trailing_zeros() {
        let path = AllocationPath {
            start_month: 0,
            horizon: 3,
            records: vec![
                PathRecord {
                    year: 1,
                    bucket: None,
                    factor: 1.0,
                    value: 1.0,
                },
                PathRecord {
                    year: 2,
                    bucket: Some(Bucket::ALL_EQUITY),
                    factor: 1.2,
                    value: 1.2,
                },
                PathRecord {
                    year: 3,
                    bucket: Some(Bucket::ALL_EQUITY),
                    factor: 0.0,
                    value: 0.0,
                },
            ],
        };
        assert_eq!(path.last_non_zero_value(), Some(1.2));
        assert_eq!(path.terminal_value(), 0.0);
    }
}
