use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlidepathError {
    #[error("invalid bucket label {label:?}: {reason}")]
    InvalidBucketName { label: String, reason: String },

    #[error("bucket family mismatch: table uses {expected:?}, column {label:?} does not")]
    MixedBucketFamilies { expected: String, label: String },

    #[error("bucket {label:?} appears more than once")]
    DuplicateBucket { label: String },

    #[error("required column {0:?} is missing")]
    MissingColumn(String),

    #[error("non-numeric factor in column {column:?} at month {month}")]
    NonNumericFactor { column: String, month: u32 },

    #[error("row for month {month} has {actual} values, expected {expected}")]
    RowWidthMismatch {
        month: u32,
        expected: usize,
        actual: usize,
    },

    #[error("month indices must be contiguous: expected {expected}, found {found}")]
    NonContiguousMonths { expected: u32, found: u32 },

    #[error("return factor table has no rows")]
    EmptyTable,

    #[error("{rows} rows starting at month {first_month} run past the last representable month")]
    MonthOverflow { first_month: u32, rows: usize },

    #[error(
        "month {month} is out of range (table covers {first_month}..={last_month}) \
         for the path starting at {start_month}, year {year}"
    )]
    OutOfRange {
        start_month: u32,
        year: u32,
        month: u32,
        first_month: u32,
        last_month: u32,
    },

    #[error("no allocation bucket matches equity weight {equity_weight:?} for horizon {horizon}")]
    UnresolvedAllocation {
        horizon: u32,
        equity_weight: Option<f64>,
    },

    #[error("cost for {bucket} at horizon {horizon} is undefined (insufficient history)")]
    UndefinedCost { bucket: String, horizon: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GlidepathError {
    /// Short machine-readable tag used in exclusion summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            GlidepathError::InvalidBucketName { .. } => "invalid-bucket-name",
            GlidepathError::MixedBucketFamilies { .. } => "mixed-bucket-families",
            GlidepathError::DuplicateBucket { .. } => "duplicate-bucket",
            GlidepathError::MissingColumn(_) => "missing-column",
            GlidepathError::NonNumericFactor { .. } => "non-numeric-factor",
            GlidepathError::RowWidthMismatch { .. } => "row-width-mismatch",
            GlidepathError::NonContiguousMonths { .. } => "non-contiguous-months",
            GlidepathError::EmptyTable => "empty-table",
            GlidepathError::MonthOverflow { .. } => "month-overflow",
            GlidepathError::OutOfRange { .. } => "out-of-range",
            GlidepathError::UnresolvedAllocation { .. } => "unresolved-allocation",
            GlidepathError::UndefinedCost { .. } => "undefined-cost",
            GlidepathError::InvalidConfig(_) => "invalid-config",
            GlidepathError::Csv(_) => "csv",
            GlidepathError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, GlidepathError>;
