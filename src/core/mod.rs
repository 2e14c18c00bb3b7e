mod engine;
mod error;
mod factors;
mod matrix;
mod selector;
mod simulator;
mod types;

pub use engine::{
    GlidePathModel, combined_table, ending_value_stats, run_study, static_ending_values,
    summarize, summarize_exclusions,
};
pub use error::{GlidepathError, Result};
pub use factors::ReturnFactorTable;
pub use matrix::{CostMatrix, GlidePlan};
pub use selector::{AllocationSelector, remaining_horizon};
pub use simulator::PathSimulator;
pub use types::{
    AggregationPolicy, AllocationPath, AuditRow, Bucket, BucketSet, CostMatrixRow,
    EndingValueStats, ExcludedPath, ExclusionSummary, GlidePlanEntry, HorizonSummary,
    HorizonTable, MONTHS_PER_YEAR, MonthIndex, PathFailure, PathRecord, SeedPolicy,
    SimulationBatch, SimulationConfig, StartMonthValue, StartMonthValues, StudyReport,
    parse_bucket_label,
};
