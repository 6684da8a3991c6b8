// 🚨 Errors and Warnings
// Fatal conditions abort a stage; warnings travel alongside successful output
//
// Every warning is group-scoped so a caller can list discrepancies one by one
// instead of reading an aggregate.

use crate::geography::{GeoKey, GeographyLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LandUseError>;

// ============================================================================
// FATAL ERRORS
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LandUseError {
    #[error("missing column '{column}' in {table}")]
    MissingColumn { column: String, table: String },

    #[error(
        "block group {block_group}: household pool weight {pool_weight} does not match control total {control_total}"
    )]
    SupplyDemandMismatch {
        block_group: i64,
        pool_weight: f64,
        control_total: f64,
    },

    #[error("invalid scale method '{method}': {reason}")]
    InvalidScaleMethod { method: String, reason: String },

    #[error("snapshot years must satisfy left < right (got {left} and {right})")]
    InvalidSnapshotYears { left: i32, right: i32 },

    #[error("parcel {parcel_id} is not in the geographic hierarchy")]
    UnknownParcel { parcel_id: i64 },

    #[error("{finer} group {key} spans more than one {coarser} group")]
    NonNestedHierarchy {
        finer: GeographyLevel,
        coarser: GeographyLevel,
        key: GeoKey,
    },

    #[error("block group {block_group} has households but no parcels")]
    NoParcelsInBlockGroup { block_group: i64 },

    #[error("household {household_id} has invalid expansion factor {weight}")]
    InvalidWeight { household_id: i64, weight: f64 },

    #[error("parcel {parcel_id} appears more than once")]
    DuplicateParcel { parcel_id: i64 },

    #[error("control {column} for {key} must be a finite non-negative number (got {value})")]
    InvalidControl { key: GeoKey, column: String, value: f64 },
}

impl LandUseError {
    pub fn missing_column(column: &str, table: &str) -> Self {
        LandUseError::MissingColumn {
            column: column.to_string(),
            table: table.to_string(),
        }
    }
}

// ============================================================================
// NON-FATAL WARNINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The group's current total is zero while its control is not; the scale
    /// factor falls back to 1 (or the control is spread evenly when enabled)
    ZeroControlWithNonzeroCurrent {
        level: GeographyLevel,
        key: GeoKey,
        control_total: f64,
    },

    /// Controlled rounding ran out of eligible rows before the group sum met
    /// its target. `remaining` is target minus achieved sum.
    UnresolvedRoundingRemainder {
        column: String,
        level: GeographyLevel,
        key: GeoKey,
        remaining: i64,
    },

    /// Extrapolation produced a negative count that was clamped to zero
    NegativeInterpolatedValue {
        parcel_id: i64,
        column: String,
        value: f64,
    },

    /// A leftover household could not fit any parcel's open capacity and was
    /// placed on a parcel that is now over its target
    CapacityOverflow {
        block_group: i64,
        household_id: i64,
        parcel_id: i64,
    },
}

impl Warning {
    /// Group key of the warning, when it is group-scoped
    pub fn group_key(&self) -> Option<&GeoKey> {
        match self {
            Warning::ZeroControlWithNonzeroCurrent { key, .. } => Some(key),
            Warning::UnresolvedRoundingRemainder { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Warning::ZeroControlWithNonzeroCurrent {
                level,
                key,
                control_total,
            } => format!(
                "{} {}: current total is 0 but control is {}",
                level, key, control_total
            ),
            Warning::UnresolvedRoundingRemainder {
                column,
                level,
                key,
                remaining,
            } => format!(
                "{} {} ({}): rounding left {} unresolved",
                level, key, column, remaining
            ),
            Warning::NegativeInterpolatedValue {
                parcel_id,
                column,
                value,
            } => format!(
                "parcel {} ({}): interpolated {} clamped to 0",
                parcel_id, column, value
            ),
            Warning::CapacityOverflow {
                block_group,
                household_id,
                parcel_id,
            } => format!(
                "block group {}: household {} overflows parcel {}",
                block_group, household_id, parcel_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_group() {
        let err = LandUseError::SupplyDemandMismatch {
            block_group: 530610521042,
            pool_weight: 12.0,
            control_total: 10.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("530610521042"));
        assert!(msg.contains("12"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let warning = Warning::UnresolvedRoundingRemainder {
            column: "HH_P".to_string(),
            level: GeographyLevel::Taz,
            key: GeoKey::Id(42),
            remaining: 3,
        };

        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "unresolved_rounding_remainder");
        assert_eq!(json["remaining"], 3);
        assert_eq!(warning.group_key(), Some(&GeoKey::Id(42)));
        assert!(warning.summary().contains("TAZ 42"));
    }
}
