// ⚖️ Scaling to control totals
// Rescale per-parcel counts so a chosen level (usually TAZ) matches externally
// supplied controls.
//
//   scale = control_total / current_total   (current_total != 0)
//   scale = 1                               (current_total == 0)
//
// Scaled values get a first-pass rounding only. Exact group sums are the
// ControlledRounder's job; the integer targets it needs are returned here.

use crate::error::{LandUseError, Result, Warning};
use crate::geography::{group_rng, GeoKey, GeographicHierarchy, GeographyLevel, ParcelId};
use crate::records::{CategorySet, ControlTable, ParcelTable};
use crate::rounding::{naive_round, ControlledRounder, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

// ============================================================================
// SCALE METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMethod {
    /// Replace parcel values with the jurisdiction's own parcel estimates
    KeepAsIs,
    /// One factor per group from the group's total control
    Proportional,
    /// One factor per group and category from per-category controls
    ByCategory,
}

impl ScaleMethod {
    pub fn name(&self) -> &str {
        match self {
            ScaleMethod::KeepAsIs => "keep_as_is",
            ScaleMethod::Proportional => "proportional",
            ScaleMethod::ByCategory => "by_category",
        }
    }
}

impl fmt::Display for ScaleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScaleMethod {
    type Err = LandUseError;

    /// Accepts the short names and the long names used in processing-rule files
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "keep_as_is" | "Keep_the_Data_from_the_Partner_City" => Ok(ScaleMethod::KeepAsIs),
            "proportional" | "Scale_by_Total_Jobs_by_TAZ" | "Scale_by_Total_Hhs_by_TAZ" => {
                Ok(ScaleMethod::Proportional)
            }
            "by_category" | "Scale_by_Job_Category" => Ok(ScaleMethod::ByCategory),
            other => Err(LandUseError::InvalidScaleMethod {
                method: other.to_string(),
                reason: "unknown scale method".to_string(),
            }),
        }
    }
}

// ============================================================================
// INPUTS AND OUTPUTS
// ============================================================================

/// What a jurisdiction supplied
#[derive(Debug, Clone, PartialEq)]
pub enum LocalInput {
    /// Parcel-level estimates; when `jurisdiction` is set, its parcels that
    /// the estimates omit can be zeroed
    ParcelEstimates {
        jurisdiction: Option<String>,
        table: ParcelTable,
    },
    /// Group-level control totals
    GroupControls(ControlTable),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalerOptions {
    /// Spread a control evenly over a group whose current total is zero
    /// (single-component category sets only)
    pub distribute_evenly_when_empty: bool,
    /// Round each scaled value to the nearest integer
    pub first_pass_rounding: bool,
    /// With parcel estimates, zero jurisdiction parcels the estimates omit
    pub zero_omitted_parcels: bool,
    /// Strategy used to split a group control into category targets
    pub split_strategy: RoundingStrategy,
}

impl Default for ScalerOptions {
    fn default() -> Self {
        ScalerOptions {
            distribute_evenly_when_empty: false,
            first_pass_rounding: true,
            zero_omitted_parcels: true,
            split_strategy: RoundingStrategy::RandomBatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactor {
    pub key: GeoKey,
    pub column: String,
    pub current_total: f64,
    pub control_total: f64,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOutcome {
    pub table: ParcelTable,
    /// Level the controls apply at; None for parcel estimates
    pub level: Option<GeographyLevel>,
    pub factors: Vec<ScaleFactor>,
    /// Integer target per category and controlled group
    pub targets: BTreeMap<String, BTreeMap<GeoKey, i64>>,
    pub warnings: Vec<Warning>,
}

// ============================================================================
// SCALER
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Scaler {
    pub method: ScaleMethod,
    pub options: ScalerOptions,
}

impl Scaler {
    pub fn new(method: ScaleMethod) -> Self {
        Scaler {
            method,
            options: ScalerOptions::default(),
        }
    }

    pub fn with_options(method: ScaleMethod, options: ScalerOptions) -> Self {
        Scaler { method, options }
    }

    /// Apply the jurisdiction's input to `table`, returning a fresh table
    pub fn scale(
        &self,
        table: &ParcelTable,
        hierarchy: &GeographicHierarchy,
        input: &LocalInput,
        categories: &CategorySet,
        seed: u64,
    ) -> Result<ScaleOutcome> {
        let components: Vec<&str> = categories.components.iter().map(|c| c.as_str()).collect();
        table.require_columns(&components, "parcel table")?;
        table.require_unique_ids()?;

        match (self.method, input) {
            (ScaleMethod::KeepAsIs, LocalInput::ParcelEstimates { jurisdiction, table: local }) => {
                self.replace_with_local(table, local, jurisdiction.as_deref(), categories)
            }
            (ScaleMethod::Proportional, LocalInput::GroupControls(controls)) => {
                self.scale_proportional(table, hierarchy, controls, categories, seed)
            }
            (ScaleMethod::ByCategory, LocalInput::GroupControls(controls)) => {
                self.scale_by_category(table, hierarchy, controls, categories)
            }
            (method, LocalInput::ParcelEstimates { .. }) => Err(LandUseError::InvalidScaleMethod {
                method: method.to_string(),
                reason: "parcel estimates can only be kept as-is".to_string(),
            }),
            (method, LocalInput::GroupControls(_)) => Err(LandUseError::InvalidScaleMethod {
                method: method.to_string(),
                reason: "group controls need a scaling method".to_string(),
            }),
        }
    }

    fn replace_with_local(
        &self,
        table: &ParcelTable,
        local: &ParcelTable,
        jurisdiction: Option<&str>,
        categories: &CategorySet,
    ) -> Result<ScaleOutcome> {
        let components: Vec<&str> = categories.components.iter().map(|c| c.as_str()).collect();
        local.require_columns(&components, "local parcel estimates")?;
        local.require_unique_ids()?;

        let local_index = local.index();
        let wanted = jurisdiction.map(|j| j.trim().to_uppercase());
        let mut out = table.clone();
        let mut replaced = 0usize;
        let mut zeroed = 0usize;

        for record in &mut out.records {
            if let Some(&i) = local_index.get(&record.parcel_id) {
                for column in &categories.components {
                    record.set(column, local.records[i].get(column));
                }
                replaced += 1;
            } else if self.options.zero_omitted_parcels
                && wanted.as_deref() == Some(record.jurisdiction.trim().to_uppercase().as_str())
            {
                for column in &categories.components {
                    record.set(column, 0.0);
                }
                zeroed += 1;
            }
        }

        let base_index = table.index();
        let unknown = local
            .records
            .iter()
            .filter(|r| !base_index.contains_key(&r.parcel_id))
            .count();
        if unknown > 0 {
            warn!(unknown, "local estimates name parcels missing from the parcel table");
        }
        info!(replaced, zeroed, "parcel values replaced with local estimates");

        out.recompute_totals(categories);
        Ok(ScaleOutcome {
            table: out,
            level: None,
            factors: Vec::new(),
            targets: BTreeMap::new(),
            warnings: Vec::new(),
        })
    }

    /// Parcels of controlled groups, grouped and sorted by parcel id
    fn controlled_groups(
        table: &ParcelTable,
        hierarchy: &GeographicHierarchy,
        controls: &ControlTable,
    ) -> Result<BTreeMap<GeoKey, Vec<ParcelId>>> {
        let mut groups = hierarchy.group(table.parcel_ids(), controls.level)?;
        groups.retain(|key, _| controls.contains(key));
        for ids in groups.values_mut() {
            ids.sort_unstable();
        }
        Ok(groups)
    }

    fn scale_proportional(
        &self,
        table: &ParcelTable,
        hierarchy: &GeographicHierarchy,
        controls: &ControlTable,
        categories: &CategorySet,
        seed: u64,
    ) -> Result<ScaleOutcome> {
        let level = controls.level;
        let control_name = categories.control_name().to_string();
        let groups = Self::controlled_groups(table, hierarchy, controls)?;
        let index = table.index();
        let splitter = ControlledRounder::new(self.options.split_strategy);

        let mut out = table.clone();
        let mut factors = Vec::new();
        let mut warnings = Vec::new();
        let mut targets: BTreeMap<String, BTreeMap<GeoKey, i64>> = BTreeMap::new();

        for (key, parcel_ids) in &groups {
            let control = group_control(controls, key, &control_name, categories)?;
            let current: f64 = parcel_ids
                .iter()
                .map(|id| categories.sum(&table.records[index[id]]))
                .sum();

            let factor = if current != 0.0 { control / current } else { 1.0 };
            if current == 0.0 && control != 0.0 {
                warn!(%level, group = %key, control, "zero current total with nonzero control");
                warnings.push(Warning::ZeroControlWithNonzeroCurrent {
                    level,
                    key: key.clone(),
                    control_total: control,
                });
            }

            let spread_evenly = current == 0.0
                && control != 0.0
                && self.options.distribute_evenly_when_empty
                && categories.components.len() == 1;

            let mut scaled_sums = vec![0.0; categories.components.len()];
            for id in parcel_ids {
                let record = &mut out.records[index[id]];
                for (c, column) in categories.components.iter().enumerate() {
                    let value = if spread_evenly {
                        control / parcel_ids.len() as f64
                    } else {
                        record.get(column) * factor
                    };
                    scaled_sums[c] += value;
                    record.set(column, self.first_pass(value));
                }
                record.recompute_total(categories);
            }

            // split the group's integer control into category targets that sum to it
            let group_target = naive_round(control);
            let split = if categories.components.len() == 1 {
                vec![group_target]
            } else {
                let mut rng = group_rng(seed, "category_split", level, key);
                splitter.round_group(&scaled_sums, group_target, &mut rng).values
            };
            for (column, target) in categories.components.iter().zip(split) {
                targets.entry(column.clone()).or_default().insert(key.clone(), target);
            }

            debug!(%level, group = %key, current, control, factor, "group scaled");
            factors.push(ScaleFactor {
                key: key.clone(),
                column: control_name.clone(),
                current_total: current,
                control_total: control,
                factor,
            });
        }

        info!(%level, groups = groups.len(), "proportional scaling complete");
        Ok(ScaleOutcome {
            table: out,
            level: Some(level),
            factors,
            targets,
            warnings,
        })
    }

    fn scale_by_category(
        &self,
        table: &ParcelTable,
        hierarchy: &GeographicHierarchy,
        controls: &ControlTable,
        categories: &CategorySet,
    ) -> Result<ScaleOutcome> {
        let level = controls.level;
        let groups = Self::controlled_groups(table, hierarchy, controls)?;
        let index = table.index();

        let mut out = table.clone();
        let mut factors = Vec::new();
        let mut warnings = Vec::new();
        let mut targets: BTreeMap<String, BTreeMap<GeoKey, i64>> = BTreeMap::new();

        for (key, parcel_ids) in &groups {
            for column in &categories.components {
                let control = controls
                    .get(key, column)
                    .ok_or_else(|| LandUseError::missing_column(column, "control totals"))
                    .and_then(|value| checked_control(key, column, value))?;
                let current: f64 = parcel_ids
                    .iter()
                    .map(|id| table.records[index[id]].get(column))
                    .sum();

                let factor = if current != 0.0 { control / current } else { 1.0 };
                if current == 0.0 && control != 0.0 {
                    warn!(%level, group = %key, column = column.as_str(), control, "zero current total with nonzero control");
                    warnings.push(Warning::ZeroControlWithNonzeroCurrent {
                        level,
                        key: key.clone(),
                        control_total: control,
                    });
                }

                for id in parcel_ids {
                    let record = &mut out.records[index[id]];
                    let value = record.get(column) * factor;
                    record.set(column, self.first_pass(value));
                }

                targets
                    .entry(column.clone())
                    .or_default()
                    .insert(key.clone(), naive_round(control));
                factors.push(ScaleFactor {
                    key: key.clone(),
                    column: column.clone(),
                    current_total: current,
                    control_total: control,
                    factor,
                });
            }
        }
        out.recompute_totals(categories);

        info!(%level, groups = groups.len(), "category scaling complete");
        Ok(ScaleOutcome {
            table: out,
            level: Some(level),
            factors,
            targets,
            warnings,
        })
    }

    fn first_pass(&self, value: f64) -> f64 {
        if self.options.first_pass_rounding {
            value.round_ties_even()
        } else {
            value
        }
    }
}

/// The group's overall control: the named total, or the sum of component
/// controls when every component has one
fn group_control(controls: &ControlTable, key: &GeoKey, control_name: &str, categories: &CategorySet) -> Result<f64> {
    if let Some(total) = controls.get(key, control_name) {
        return checked_control(key, control_name, total);
    }
    let mut sum = 0.0;
    for column in &categories.components {
        let value = controls
            .get(key, column)
            .ok_or_else(|| LandUseError::missing_column(control_name, "control totals"))?;
        sum += checked_control(key, column, value)?;
    }
    Ok(sum)
}

/// Controls are counts: finite and never negative
fn checked_control(key: &GeoKey, column: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(LandUseError::InvalidControl {
            key: key.clone(),
            column: column.to_string(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ControlTotal, ParcelRecord};
    use pretty_assertions::assert_eq;

    fn jobs() -> CategorySet {
        CategorySet::new(&["EMPEDU_P", "EMPRET_P"], Some("EMPTOT_P"))
    }

    fn parcel(id: i64, taz: i64, edu: f64, ret: f64) -> ParcelRecord {
        ParcelRecord::new(id, taz, taz * 100, "Kirkland")
            .with_count("EMPEDU_P", edu)
            .with_count("EMPRET_P", ret)
            .with_count("EMPTOT_P", edu + ret)
    }

    fn table(records: Vec<ParcelRecord>) -> ParcelTable {
        ParcelTable::new(
            vec!["EMPEDU_P".into(), "EMPRET_P".into(), "EMPTOT_P".into()],
            records,
        )
    }

    fn taz_controls(rows: &[(i64, f64)]) -> LocalInput {
        let controls = rows
            .iter()
            .map(|(taz, total)| ControlTotal::new(GeoKey::Id(*taz)).with_total("EMPTOT_P", *total))
            .collect();
        LocalInput::GroupControls(ControlTable::from_controls(GeographyLevel::Taz, controls))
    }

    #[test]
    fn test_proportional_scaling_and_category_targets() {
        let base = table(vec![parcel(1, 1, 2.0, 1.0), parcel(2, 1, 2.0, 0.0), parcel(3, 2, 5.0, 5.0)]);
        let out = Scaler::new(ScaleMethod::Proportional)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 10.0)]), &jobs(), 1)
            .unwrap();

        assert_eq!(out.table.get(1).unwrap().get("EMPEDU_P"), 4.0);
        assert_eq!(out.table.get(1).unwrap().get("EMPRET_P"), 2.0);
        assert_eq!(out.table.get(2).unwrap().get("EMPTOT_P"), 4.0);
        // uncontrolled TAZ untouched
        assert_eq!(out.table.get(3).unwrap(), base.get(3).unwrap());

        assert_eq!(out.factors.len(), 1);
        assert_eq!(out.factors[0].factor, 2.0);
        assert_eq!(out.targets["EMPEDU_P"][&GeoKey::Id(1)], 8);
        assert_eq!(out.targets["EMPRET_P"][&GeoKey::Id(1)], 2);
    }

    #[test]
    fn test_negative_or_nan_control_is_rejected() {
        let base = table(vec![parcel(1, 1, 2.0, 0.0), parcel(2, 1, 3.0, 0.0)]);
        let scaler = Scaler::new(ScaleMethod::Proportional);

        let err = scaler
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, -5.0)]), &jobs(), 1)
            .unwrap_err();
        assert_eq!(
            err,
            LandUseError::InvalidControl {
                key: GeoKey::Id(1),
                column: "EMPTOT_P".to_string(),
                value: -5.0,
            }
        );

        let err = scaler
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, f64::NAN)]), &jobs(), 1)
            .unwrap_err();
        assert!(matches!(err, LandUseError::InvalidControl { ref column, .. } if column == "EMPTOT_P"));
    }

    #[test]
    fn test_negative_category_control_is_rejected() {
        let base = table(vec![parcel(1, 1, 2.0, 1.0)]);
        let controls = ControlTable::from_controls(
            GeographyLevel::Taz,
            vec![ControlTotal::new(GeoKey::Id(1))
                .with_total("EMPEDU_P", 4.0)
                .with_total("EMPRET_P", -1.0)],
        );
        let input = LocalInput::GroupControls(controls);

        for method in [ScaleMethod::ByCategory, ScaleMethod::Proportional] {
            let err = Scaler::new(method)
                .scale(&base, &base.hierarchy(), &input, &jobs(), 1)
                .unwrap_err();
            assert!(
                matches!(err, LandUseError::InvalidControl { ref column, value, .. } if column == "EMPRET_P" && value == -1.0),
                "{:?}",
                err
            );
        }
    }

    #[test]
    fn test_duplicate_parcel_ids_fail_scaling() {
        let base = table(vec![parcel(1, 1, 2.0, 0.0), parcel(1, 1, 2.0, 0.0), parcel(2, 1, 1.0, 0.0)]);
        let err = Scaler::new(ScaleMethod::Proportional)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 10.0)]), &jobs(), 1)
            .unwrap_err();
        assert_eq!(err, LandUseError::DuplicateParcel { parcel_id: 1 });
    }

    #[test]
    fn test_category_targets_sum_to_group_control() {
        let base = table(vec![parcel(1, 1, 1.0, 1.0), parcel(2, 1, 1.0, 0.0)]);
        let out = Scaler::new(ScaleMethod::Proportional)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 7.0)]), &jobs(), 99)
            .unwrap();

        let total: i64 = out.targets.values().map(|t| t[&GeoKey::Id(1)]).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_zero_current_total_keeps_values() {
        let base = table(vec![parcel(1, 1, 0.0, 0.0), parcel(2, 1, 0.0, 0.0)]);

        let zero_control = Scaler::new(ScaleMethod::Proportional)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 0.0)]), &jobs(), 1)
            .unwrap();
        assert_eq!(zero_control.table, base);
        assert!(zero_control.warnings.is_empty());

        let nonzero_control = Scaler::new(ScaleMethod::Proportional)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 6.0)]), &jobs(), 1)
            .unwrap();
        assert_eq!(nonzero_control.table, base);
        assert_eq!(nonzero_control.factors[0].factor, 1.0);
        assert!(matches!(
            nonzero_control.warnings[0],
            Warning::ZeroControlWithNonzeroCurrent { .. }
        ));
    }

    #[test]
    fn test_even_distribution_for_empty_household_group() {
        let households = CategorySet::households();
        let base = ParcelTable::new(
            vec!["HH_P".into()],
            vec![
                ParcelRecord::new(1, 4, 40, "Redmond").with_count("HH_P", 0.0),
                ParcelRecord::new(2, 4, 40, "Redmond").with_count("HH_P", 0.0),
            ],
        );
        let controls = LocalInput::GroupControls(ControlTable::from_controls(
            GeographyLevel::Taz,
            vec![ControlTotal::new(GeoKey::Id(4)).with_total("HH_P", 5.0)],
        ));
        let options = ScalerOptions {
            distribute_evenly_when_empty: true,
            first_pass_rounding: false,
            ..ScalerOptions::default()
        };

        let out = Scaler::with_options(ScaleMethod::Proportional, options)
            .scale(&base, &base.hierarchy(), &controls, &households, 1)
            .unwrap();
        assert_eq!(out.table.get(1).unwrap().get("HH_P"), 2.5);
        assert_eq!(out.targets["HH_P"][&GeoKey::Id(4)], 5);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_scale_by_category() {
        let base = table(vec![parcel(1, 1, 3.0, 1.0), parcel(2, 1, 1.0, 1.0)]);
        let controls = LocalInput::GroupControls(ControlTable::from_controls(
            GeographyLevel::Taz,
            vec![ControlTotal::new(GeoKey::Id(1))
                .with_total("EMPEDU_P", 8.0)
                .with_total("EMPRET_P", 1.0)],
        ));

        let out = Scaler::new(ScaleMethod::ByCategory)
            .scale(&base, &base.hierarchy(), &controls, &jobs(), 1)
            .unwrap();
        assert_eq!(out.table.get(1).unwrap().get("EMPEDU_P"), 6.0);
        assert_eq!(out.table.get(2).unwrap().get("EMPEDU_P"), 2.0);
        assert_eq!(out.table.get(1).unwrap().get("EMPRET_P"), 0.0); // 0.5 → 0
        assert_eq!(out.targets["EMPRET_P"][&GeoKey::Id(1)], 1);
        assert_eq!(out.table.get(1).unwrap().get("EMPTOT_P"), 6.0);
    }

    #[test]
    fn test_by_category_requires_each_control() {
        let base = table(vec![parcel(1, 1, 3.0, 1.0)]);
        let err = Scaler::new(ScaleMethod::ByCategory)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 5.0)]), &jobs(), 1)
            .unwrap_err();
        assert_eq!(err, LandUseError::missing_column("EMPEDU_P", "control totals"));
    }

    #[test]
    fn test_keep_as_is_replaces_and_zeroes_omitted() {
        let base = table(vec![parcel(1, 1, 3.0, 1.0), parcel(2, 1, 1.0, 1.0)]);
        let local = table(vec![parcel(1, 1, 10.0, 0.0)]);
        let input = LocalInput::ParcelEstimates {
            jurisdiction: Some("kirkland".to_string()),
            table: local,
        };

        let out = Scaler::new(ScaleMethod::KeepAsIs)
            .scale(&base, &base.hierarchy(), &input, &jobs(), 1)
            .unwrap();
        assert_eq!(out.table.get(1).unwrap().get("EMPTOT_P"), 10.0);
        assert_eq!(out.table.get(2).unwrap().get("EMPTOT_P"), 0.0);
        assert!(out.targets.is_empty());
    }

    #[test]
    fn test_invalid_scale_methods() {
        assert!(matches!(
            "Scale_by_Magic".parse::<ScaleMethod>(),
            Err(LandUseError::InvalidScaleMethod { .. })
        ));
        assert_eq!("Scale_by_Total_Hhs_by_TAZ".parse::<ScaleMethod>().unwrap(), ScaleMethod::Proportional);

        let base = table(vec![parcel(1, 1, 3.0, 1.0)]);
        let err = Scaler::new(ScaleMethod::KeepAsIs)
            .scale(&base, &base.hierarchy(), &taz_controls(&[(1, 5.0)]), &jobs(), 1)
            .unwrap_err();
        assert!(matches!(err, LandUseError::InvalidScaleMethod { .. }));
    }
}
