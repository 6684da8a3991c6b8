// 🚦 Pipeline
// Interpolator → Scaler → ControlledRounder → Allocator over in-memory tables
//
// Every stage takes the previous stage's table and returns a new one. The
// seed is the only source of randomness, so equal inputs and seed give a
// byte-identical digest.

use crate::allocation::{Allocation, Allocator};
use crate::config::{PipelineConfig, ProcessingRule, Subject};
use crate::error::{Result, Warning};
use crate::geography::{GeoKey, ParcelId};
use crate::interpolation::{
    household_totals_table, interpolate_household_totals, InterpolationRatio, Interpolator, Snapshot,
};
use crate::overrides::{apply_overrides, OverrideApplied};
use crate::reconciliation::{ControlReconciler, ReconciliationReport};
use crate::records::{HouseholdRecord, ParcelTable};
use crate::rounding::{naive_round, ControlledRounder};
use crate::scaling::{LocalInput, ScaleFactor, ScaleMethod, Scaler, ScalerOptions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ============================================================================
// INPUTS
// ============================================================================

/// A processing rule with its data loaded
#[derive(Debug, Clone, PartialEq)]
pub struct RuleInput {
    pub rule: ProcessingRule,
    pub method: ScaleMethod,
    pub input: LocalInput,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineInputs {
    /// Base parcels; the left snapshot when interpolating
    pub parcels: ParcelTable,
    pub right_parcels: Option<ParcelTable>,
    pub rules: Vec<RuleInput>,
    /// Households to allocate; empty skips allocation
    pub households: Vec<HouseholdRecord>,
    /// Allocated households of the two snapshot years
    pub left_households: Vec<HouseholdRecord>,
    pub right_households: Vec<HouseholdRecord>,
}

// ============================================================================
// OUTPUTS
// ============================================================================

/// SHA-256 over the integer parcel table and the allocated households
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDigest(pub String);

impl RunDigest {
    pub fn compute(table: &ParcelTable, households: &[HouseholdRecord]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(table.columns.join(",").as_bytes());
        for record in &table.records {
            hasher.update(format!(
                "\n{}|{}|{}|{}",
                record.parcel_id, record.taz_id, record.block_group_id, record.jurisdiction
            ));
            for column in &table.columns {
                hasher.update(format!("|{}", record.get(column)));
            }
        }
        for hh in households {
            hasher.update(format!(
                "\n{}|{}|{}|{}|{:?}",
                hh.household_id, hh.expansion_factor, hh.household_size, hh.block_group_id, hh.parcel_id
            ));
        }
        RunDigest(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for RunDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    /// Integer parcel table
    pub table: ParcelTable,
    pub allocation: Option<Allocation>,
    pub report: RunReport,
}

impl PipelineOutput {
    pub fn households(&self) -> &[HouseholdRecord] {
        self.allocation
            .as_ref()
            .map(|a| a.households.as_slice())
            .unwrap_or(&[])
    }
}

/// Everything a caller needs to judge the run, serialisable as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub seed: u64,
    pub horizon_year: i32,
    pub interpolation: Option<InterpolationRatio>,
    pub scale_factors: Vec<ScaleFactor>,
    pub reconciliations: Vec<ReconciliationReport>,
    pub overrides_applied: Vec<OverrideApplied>,
    pub warnings: Vec<Warning>,
    pub allocated_households: usize,
    pub digest: RunDigest,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "Run for {} (seed {}): {} warnings, {} reconciliation reports, {} households allocated, digest {}",
            self.horizon_year,
            self.seed,
            self.warnings.len(),
            self.reconciliations.len(),
            self.allocated_households,
            self.digest
        )
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Controls collected from scaling, per subject, column and group
type CollectedControls = BTreeMap<(Subject, String), BTreeMap<GeoKey, f64>>;

pub struct Pipeline {
    pub config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config }
    }

    pub fn run(&self, inputs: &PipelineInputs) -> Result<PipelineOutput> {
        self.config.validate()?;
        let config = &self.config;
        let seed = config.seed;
        let level = config.control_level;
        let jobs = config.job_set();
        let households = config.household_set();
        let mut warnings: Vec<Warning> = Vec::new();

        // 1. interpolation
        let (mut table, ratio) = self.interpolate(inputs, &mut warnings)?;
        let hierarchy = table.hierarchy();

        // 2. scaling, rule by rule
        let mut targets: BTreeMap<Subject, BTreeMap<String, BTreeMap<GeoKey, i64>>> = BTreeMap::new();
        let mut controls: CollectedControls = BTreeMap::new();
        let mut scale_factors = Vec::new();
        let options = ScalerOptions {
            distribute_evenly_when_empty: config.distribute_evenly_when_empty,
            ..ScalerOptions::default()
        };

        for rule_input in &inputs.rules {
            let subject = rule_input.rule.subject;
            let categories = config.categories(subject);
            let outcome = Scaler::with_options(rule_input.method, options).scale(
                &table,
                &hierarchy,
                &rule_input.input,
                &categories,
                seed,
            )?;
            info!(
                jurisdiction = rule_input.rule.jurisdiction.as_str(),
                method = %rule_input.method,
                "rule applied"
            );

            if let Some(rule_level) = outcome.level {
                if rule_level != level {
                    warn!(%rule_level, %level, "controls are not at the rounding level; their targets are not enforced");
                } else {
                    let subject_targets = targets.entry(subject).or_default();
                    for (column, by_group) in outcome.targets {
                        subject_targets.entry(column).or_default().extend(by_group);
                    }
                    for factor in &outcome.factors {
                        controls
                            .entry((subject, factor.column.clone()))
                            .or_default()
                            .insert(factor.key.clone(), naive_round(factor.control_total) as f64);
                    }
                }
            }
            scale_factors.extend(outcome.factors);
            warnings.extend(outcome.warnings);
            table = outcome.table;
        }

        // 3. controlled rounding
        let empty = BTreeMap::new();
        for (subject, categories) in [(Subject::Jobs, &jobs), (Subject::Households, &households)] {
            let components: Vec<&str> = categories.components.iter().map(|c| c.as_str()).collect();
            if table.require_columns(&components, "parcel table").is_err() {
                info!(?subject, "columns absent, skipping rounding");
                continue;
            }
            let rounded = ControlledRounder::new(config.rounding_strategy(subject)).round_categories(
                &table,
                categories,
                level,
                &hierarchy,
                targets.get(&subject).unwrap_or(&empty),
                seed,
            )?;
            warnings.extend(rounded.warnings);
            table = rounded.table;
        }

        // 4. crosscheck against the controls
        let reconciler = ControlReconciler::default();
        let mut reconciliations = Vec::new();
        for ((_, column), group_controls) in &controls {
            reconciliations.push(reconciler.reconcile(
                "controlled_rounding",
                &table,
                column,
                level,
                &hierarchy,
                group_controls,
            )?);
        }

        // 5. allocation
        let mut overrides_applied = Vec::new();
        let allocation = if inputs.households.is_empty() {
            None
        } else {
            let parcel_targets: BTreeMap<ParcelId, i64> = table
                .column_values(&config.household_column)
                .into_iter()
                .map(|(id, v)| (id, naive_round(v)))
                .collect();
            let (allocation_hierarchy, applied) =
                apply_overrides(&config.block_group_overrides, &hierarchy, &parcel_targets);
            overrides_applied = applied;

            let allocation = Allocator::new(config.allocation_tolerance).allocate(
                &parcel_targets,
                &allocation_hierarchy,
                &inputs.households,
                seed,
            )?;
            warnings.extend(allocation.warnings.iter().cloned());
            Some(allocation)
        };

        let allocated: &[HouseholdRecord] = allocation.as_ref().map(|a| a.households.as_slice()).unwrap_or(&[]);
        let digest = RunDigest::compute(&table, allocated);
        let report = RunReport {
            seed,
            horizon_year: config.horizon_year,
            interpolation: ratio,
            scale_factors,
            reconciliations,
            overrides_applied,
            warnings,
            allocated_households: allocated.len(),
            digest,
            finished_at: chrono::Utc::now(),
        };
        info!("{}", report.summary());

        Ok(PipelineOutput {
            table,
            allocation,
            report,
        })
    }

    /// Working table for the horizon year: the base parcels, or the
    /// interpolation of both snapshots when configured
    fn interpolate(
        &self,
        inputs: &PipelineInputs,
        warnings: &mut Vec<Warning>,
    ) -> Result<(ParcelTable, Option<InterpolationRatio>)> {
        let config = &self.config;
        let (Some(interp), Some(right)) = (&config.interpolation, &inputs.right_parcels) else {
            return Ok((inputs.parcels.clone(), None));
        };

        let interpolator = Interpolator::with_join(interp.join);
        let interpolated = interpolator.interpolate(
            Snapshot::new(interp.left_year, &inputs.parcels),
            Snapshot::new(interp.right_year, right),
            config.horizon_year,
            &config.job_set(),
        )?;
        if interpolated.ratio.is_extrapolation() {
            warn!(
                target_year = config.horizon_year,
                ratio = interpolated.ratio.ratio,
                "horizon year outside the snapshot years, extrapolating"
            );
        }
        warnings.extend(interpolated.warnings);
        let mut table = interpolated.table;

        if !inputs.left_households.is_empty() || !inputs.right_households.is_empty() {
            let totals = interpolate_household_totals(
                &inputs.left_households,
                &inputs.right_households,
                &interpolated.ratio,
            );
            let hierarchy = table.hierarchy();
            let household_table = household_totals_table(&totals, &hierarchy, &table.parcel_ids())?;
            for column in household_table.columns.clone() {
                table = table.with_column(&column, &household_table.column_values(&column));
            }
        }

        Ok((table, Some(interpolated.ratio)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingRule;
    use crate::error::LandUseError;
    use crate::geography::GeographyLevel;
    use crate::records::{ControlTable, ControlTotal, ParcelRecord};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn parcels() -> ParcelTable {
        let records = vec![
            ParcelRecord::new(1, 1, 10, "Bothell").with_count("EMPEDU_P", 1.4).with_count("HH_P", 1.6),
            ParcelRecord::new(2, 1, 10, "Bothell").with_count("EMPEDU_P", 2.2).with_count("HH_P", 0.7),
            ParcelRecord::new(3, 2, 20, "Bothell").with_count("EMPEDU_P", 0.5).with_count("HH_P", 2.2),
        ];
        ParcelTable::new(vec!["EMPEDU_P".into(), "HH_P".into()], records)
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::new(5, 2044, PathBuf::from("parcels.csv"));
        config.job_categories = vec!["EMPEDU_P".to_string()];
        config
    }

    fn job_rule(total: f64) -> RuleInput {
        RuleInput {
            rule: ProcessingRule {
                jurisdiction: "Bothell".to_string(),
                scale_method: "Scale_by_Total_Jobs_by_TAZ".to_string(),
                subject: Subject::Jobs,
                input: PathBuf::from("bothell.csv"),
                dwelling_units: false,
            },
            method: ScaleMethod::Proportional,
            input: LocalInput::GroupControls(ControlTable::from_controls(
                GeographyLevel::Taz,
                vec![ControlTotal::new(GeoKey::Id(1)).with_total("EMPTOT_P", total)],
            )),
        }
    }

    #[test]
    fn test_scaled_taz_meets_control_after_rounding() {
        let inputs = PipelineInputs {
            parcels: parcels(),
            rules: vec![job_rule(9.0)],
            ..PipelineInputs::default()
        };
        let out = Pipeline::new(config()).run(&inputs).unwrap();

        let taz1: f64 = out.table.records.iter().filter(|r| r.taz_id == 1).map(|r| r.get("EMPTOT_P")).sum();
        assert_eq!(taz1, 9.0);
        assert!(out.report.reconciliations.iter().all(|r| r.is_balanced()));
        assert!(out.table.records.iter().all(|r| r.get("HH_P").fract() == 0.0));
    }

    #[test]
    fn test_households_are_allocated() {
        // HH_P rounds to 1 + 1 in block group 10 and 2 in block group 20
        let households = vec![
            HouseholdRecord::new(1, 1.0, 3, 10),
            HouseholdRecord::new(2, 1.0, 1, 10),
            HouseholdRecord::new(3, 2.0, 2, 20),
        ];
        let inputs = PipelineInputs {
            parcels: parcels(),
            households,
            ..PipelineInputs::default()
        };
        let out = Pipeline::new(config()).run(&inputs).unwrap();

        assert_eq!(out.households().len(), 3);
        assert!(out.households().iter().all(|hh| hh.is_assigned()));
        assert_eq!(out.report.allocated_households, 3);
    }

    #[test]
    fn test_same_seed_same_digest() {
        let inputs = PipelineInputs {
            parcels: parcels(),
            rules: vec![job_rule(7.0)],
            ..PipelineInputs::default()
        };
        let a = Pipeline::new(config()).run(&inputs).unwrap();
        let b = Pipeline::new(config()).run(&inputs).unwrap();
        assert_eq!(a.report.digest, b.report.digest);
        assert_eq!(a.table, b.table);
    }

    #[test]
    fn test_invalid_rule_fails_before_any_stage() {
        let mut config = config();
        let mut rule = job_rule(1.0);
        rule.rule.scale_method = "Scale_by_Guess".to_string();
        config.rules.push(rule.rule.clone());

        let inputs = PipelineInputs {
            parcels: parcels(),
            rules: vec![rule],
            ..PipelineInputs::default()
        };
        assert!(matches!(
            Pipeline::new(config).run(&inputs),
            Err(LandUseError::InvalidScaleMethod { .. })
        ));
    }
}
