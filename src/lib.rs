// Land-Use Rounding - Core Library
// Controlled rounding and hierarchical allocation of parcel-level forecasts

pub mod error;
pub mod geography;
pub mod records;
pub mod overrides;
pub mod interpolation;
pub mod housing;
pub mod scaling;
pub mod rounding;
pub mod allocation;
pub mod reconciliation;
pub mod config;
pub mod pipeline;
pub mod io;
pub mod logging;

// Re-export commonly used types
pub use error::{LandUseError, Result, Warning};
pub use geography::{
    group_rng, BlockGroupId, GeoKey, GeographicHierarchy, GeographyLevel, ParcelGeography, ParcelId, TazId,
};
pub use records::{
    CategorySet, ControlTable, ControlTotal, HouseholdId, HouseholdRecord, ParcelRecord, ParcelTable,
    HOUSEHOLD_COLUMN, JOB_CATEGORIES, JOB_TOTAL, PERSON_COLUMN,
};
pub use overrides::{apply_overrides, BlockGroupOverride, OverrideApplied};
pub use interpolation::{
    household_totals_table, interpolate_household_totals, select_households_for_targets, InterpolationRatio,
    Interpolated, Interpolator, JoinPolicy, ParcelHouseholdTotals, Snapshot,
};
pub use housing::{household_controls, DwellingUnits, HousingAssumptions};
pub use scaling::{LocalInput, ScaleFactor, ScaleMethod, ScaleOutcome, Scaler, ScalerOptions};
pub use rounding::{
    naive_round, ControlledRounder, GroupRounding, RoundedColumn, RoundedTable, RoundingStrategy,
};
pub use allocation::{Allocation, AllocationResult, Allocator, ParcelAssignment};
pub use reconciliation::{
    ControlReconciler, Discrepancy, DiscrepancyCategory, GroupReconciliation, ReconciliationReport,
    ReconciliationResult,
};
pub use config::{InputPaths, InterpolationConfig, PipelineConfig, ProcessingRule, Subject};
pub use pipeline::{Pipeline, PipelineInputs, PipelineOutput, RuleInput, RunDigest, RunReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
