// 📋 Records - Parcels, control totals, households
// Plain tabular data exchanged between stages
//
// Stages never mutate a table they were given. They read it and build a new
// one (see `ParcelTable::with_column`), so a failed stage leaves its input intact.

use crate::error::{LandUseError, Result};
use crate::geography::{
    BlockGroupId, GeoKey, GeographicHierarchy, GeographyLevel, ParcelGeography, ParcelId, TazId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub type HouseholdId = i64;

/// Employment categories of the regional parcel file
pub const JOB_CATEGORIES: [&str; 10] = [
    "EMPEDU_P", "EMPFOO_P", "EMPGOV_P", "EMPIND_P", "EMPMED_P", "EMPOFC_P", "EMPOTH_P", "EMPRET_P",
    "EMPRSC_P", "EMPSVC_P",
];
pub const JOB_TOTAL: &str = "EMPTOT_P";
pub const HOUSEHOLD_COLUMN: &str = "HH_P";
pub const PERSON_COLUMN: &str = "PERSONS_P";

// ============================================================================
// CATEGORY SET
// ============================================================================

/// Component columns plus an optional derived total column.
///
/// The total is always recomputed from components, never carried over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySet {
    pub components: Vec<String>,
    #[serde(default)]
    pub total: Option<String>,
}

impl CategorySet {
    pub fn new(components: &[&str], total: Option<&str>) -> Self {
        CategorySet {
            components: components.iter().map(|c| c.to_string()).collect(),
            total: total.map(|t| t.to_string()),
        }
    }

    pub fn jobs() -> Self {
        CategorySet::new(&JOB_CATEGORIES, Some(JOB_TOTAL))
    }

    pub fn households() -> Self {
        CategorySet::new(&[HOUSEHOLD_COLUMN], None)
    }

    /// Components followed by the total, if any
    pub fn columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self.components.iter().map(|c| c.as_str()).collect();
        if let Some(total) = &self.total {
            cols.push(total.as_str());
        }
        cols
    }

    /// Name used for a group control covering all components
    pub fn control_name(&self) -> &str {
        match &self.total {
            Some(total) => total.as_str(),
            None => self.components.first().map(|c| c.as_str()).unwrap_or(""),
        }
    }

    pub fn sum(&self, record: &ParcelRecord) -> f64 {
        self.components.iter().map(|c| record.get(c)).sum()
    }
}

// ============================================================================
// PARCEL RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub parcel_id: ParcelId,
    pub taz_id: TazId,
    pub block_group_id: BlockGroupId,
    pub jurisdiction: String,

    /// Category name → non-negative count
    #[serde(default)]
    pub counts: BTreeMap<String, f64>,
}

impl ParcelRecord {
    pub fn new(parcel_id: ParcelId, taz_id: TazId, block_group_id: BlockGroupId, jurisdiction: &str) -> Self {
        ParcelRecord {
            parcel_id,
            taz_id,
            block_group_id,
            jurisdiction: jurisdiction.to_string(),
            counts: BTreeMap::new(),
        }
    }

    pub fn with_count(mut self, column: &str, value: f64) -> Self {
        self.counts.insert(column.to_string(), value);
        self
    }

    /// Value of a column; absent columns read as 0
    pub fn get(&self, column: &str) -> f64 {
        self.counts.get(column).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, column: &str, value: f64) {
        self.counts.insert(column.to_string(), value);
    }

    pub fn geography(&self) -> ParcelGeography {
        ParcelGeography {
            taz_id: self.taz_id,
            block_group_id: self.block_group_id,
            jurisdiction: self.jurisdiction.clone(),
        }
    }

    pub fn recompute_total(&mut self, categories: &CategorySet) {
        if let Some(total) = &categories.total {
            let sum = categories.sum(self);
            self.counts.insert(total.clone(), sum);
        }
    }
}

// ============================================================================
// PARCEL TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParcelTable {
    /// Declared columns; every column a stage requires must be listed here
    pub columns: Vec<String>,
    pub records: Vec<ParcelRecord>,
}

impl ParcelTable {
    pub fn new(columns: Vec<String>, records: Vec<ParcelRecord>) -> Self {
        ParcelTable { columns, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Fail with `MissingColumn` on the first required column not declared
    pub fn require_columns(&self, required: &[&str], table: &str) -> Result<()> {
        for column in required {
            if !self.has_column(column) {
                return Err(LandUseError::missing_column(column, table));
            }
        }
        Ok(())
    }

    /// Fail with `DuplicateParcel` on the first id seen twice
    pub fn require_unique_ids(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.records.len());
        for record in &self.records {
            if !seen.insert(record.parcel_id) {
                return Err(LandUseError::DuplicateParcel {
                    parcel_id: record.parcel_id,
                });
            }
        }
        Ok(())
    }

    pub fn add_column(&mut self, column: &str) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
    }

    pub fn parcel_ids(&self) -> Vec<ParcelId> {
        self.records.iter().map(|r| r.parcel_id).collect()
    }

    /// Row position by parcel id
    pub fn index(&self) -> HashMap<ParcelId, usize> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.parcel_id, i))
            .collect()
    }

    pub fn get(&self, parcel_id: ParcelId) -> Option<&ParcelRecord> {
        self.records.iter().find(|r| r.parcel_id == parcel_id)
    }

    pub fn hierarchy(&self) -> GeographicHierarchy {
        let mut hierarchy = GeographicHierarchy::new();
        for record in &self.records {
            hierarchy.insert(record.parcel_id, record.geography());
        }
        hierarchy
    }

    pub fn column_values(&self, column: &str) -> BTreeMap<ParcelId, f64> {
        self.records
            .iter()
            .map(|r| (r.parcel_id, r.get(column)))
            .collect()
    }

    pub fn column_sum(&self, column: &str) -> f64 {
        self.records.iter().map(|r| r.get(column)).sum()
    }

    /// Fresh table with `column` replaced for the listed parcels; other
    /// parcels keep their value
    pub fn with_column(&self, column: &str, values: &BTreeMap<ParcelId, f64>) -> ParcelTable {
        let mut out = self.clone();
        out.add_column(column);
        for record in &mut out.records {
            if let Some(value) = values.get(&record.parcel_id) {
                record.set(column, *value);
            }
        }
        out
    }

    pub fn recompute_totals(&mut self, categories: &CategorySet) {
        if let Some(total) = &categories.total {
            self.add_column(total);
        }
        for record in &mut self.records {
            record.recompute_total(categories);
        }
    }

    /// Sum of `column` per group at `level`
    pub fn sum_by(
        &self,
        column: &str,
        level: GeographyLevel,
        hierarchy: &GeographicHierarchy,
    ) -> Result<BTreeMap<GeoKey, f64>> {
        let mut sums: BTreeMap<GeoKey, f64> = BTreeMap::new();
        for record in &self.records {
            let key = hierarchy.key(record.parcel_id, level)?;
            *sums.entry(key).or_insert(0.0) += record.get(column);
        }
        Ok(sums)
    }
}

// ============================================================================
// CONTROL TOTALS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlTotal {
    pub key: GeoKey,
    /// Category (or total column) name → target
    pub totals: BTreeMap<String, f64>,
}

impl ControlTotal {
    pub fn new(key: GeoKey) -> Self {
        ControlTotal {
            key,
            totals: BTreeMap::new(),
        }
    }

    pub fn with_total(mut self, column: &str, value: f64) -> Self {
        self.totals.insert(column.to_string(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        self.totals.get(column).copied()
    }
}

/// Controls for one geography level; immutable once loaded for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlTable {
    pub level: GeographyLevel,
    pub controls: BTreeMap<GeoKey, ControlTotal>,
}

impl ControlTable {
    pub fn new(level: GeographyLevel) -> Self {
        ControlTable {
            level,
            controls: BTreeMap::new(),
        }
    }

    pub fn from_controls(level: GeographyLevel, controls: Vec<ControlTotal>) -> Self {
        ControlTable {
            level,
            controls: controls.into_iter().map(|c| (c.key.clone(), c)).collect(),
        }
    }

    pub fn insert(&mut self, control: ControlTotal) {
        self.controls.insert(control.key.clone(), control);
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    pub fn contains(&self, key: &GeoKey) -> bool {
        self.controls.contains_key(key)
    }

    pub fn get(&self, key: &GeoKey, column: &str) -> Option<f64> {
        self.controls.get(key).and_then(|c| c.get(column))
    }
}

// ============================================================================
// HOUSEHOLDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdRecord {
    pub household_id: HouseholdId,

    /// How many real households this record stands for
    pub expansion_factor: f64,

    pub household_size: u32,

    /// Origin block group from population synthesis
    pub block_group_id: BlockGroupId,

    /// Set by the allocator
    #[serde(default)]
    pub parcel_id: Option<ParcelId>,
}

impl HouseholdRecord {
    pub fn new(household_id: HouseholdId, expansion_factor: f64, household_size: u32, block_group_id: BlockGroupId) -> Self {
        HouseholdRecord {
            household_id,
            expansion_factor,
            household_size,
            block_group_id,
            parcel_id: None,
        }
    }

    pub fn persons(&self) -> f64 {
        self.expansion_factor * self.household_size as f64
    }

    pub fn is_assigned(&self) -> bool {
        self.parcel_id.is_some()
    }
}
