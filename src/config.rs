// ⚙️ Pipeline configuration
// One JSON file per run: seed, years, processing rules, and input/output paths
//
// Scale-method strings are checked by `validate` so a bad rule fails before
// any stage runs.

use crate::error::LandUseError;
use crate::geography::GeographyLevel;
use crate::housing::HousingAssumptions;
use crate::interpolation::JoinPolicy;
use crate::overrides::BlockGroupOverride;
use crate::records::{CategorySet, HOUSEHOLD_COLUMN, JOB_CATEGORIES, JOB_TOTAL};
use crate::rounding::RoundingStrategy;
use crate::scaling::ScaleMethod;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// RULES
// ============================================================================

/// Which counts a rule adjusts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    #[default]
    Jobs,
    Households,
}

/// How one jurisdiction's data is folded into the regional parcel file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRule {
    pub jurisdiction: String,

    /// See `ScaleMethod::from_str` for accepted names
    pub scale_method: String,

    #[serde(default)]
    pub subject: Subject,

    /// Parcel estimates (keep-as-is) or group controls CSV
    pub input: PathBuf,

    /// Controls are dwelling units (`sf_units`, `mf_units`) to convert
    /// with the jurisdiction's housing assumptions
    #[serde(default)]
    pub dwelling_units: bool,
}

impl ProcessingRule {
    pub fn method(&self) -> std::result::Result<ScaleMethod, LandUseError> {
        self.scale_method.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterpolationConfig {
    pub left_year: i32,
    pub right_year: i32,
    #[serde(default)]
    pub join: JoinPolicy,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputPaths {
    /// Base parcel file (the left snapshot when interpolating)
    pub parcels: PathBuf,
    #[serde(default)]
    pub right_parcels: Option<PathBuf>,
    /// Synthetic households to allocate
    #[serde(default)]
    pub households: Option<PathBuf>,
    /// Allocated households of the two snapshot years
    #[serde(default)]
    pub left_households: Option<PathBuf>,
    #[serde(default)]
    pub right_households: Option<PathBuf>,
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub seed: u64,
    pub horizon_year: i32,

    #[serde(default)]
    pub interpolation: Option<InterpolationConfig>,

    #[serde(default = "default_control_level")]
    pub control_level: GeographyLevel,

    #[serde(default = "default_job_categories")]
    pub job_categories: Vec<String>,
    #[serde(default = "default_job_total")]
    pub job_total: String,
    #[serde(default = "default_household_column")]
    pub household_column: String,

    #[serde(default = "default_job_rounding")]
    pub job_rounding: RoundingStrategy,
    #[serde(default)]
    pub household_rounding: RoundingStrategy,

    #[serde(default)]
    pub rules: Vec<ProcessingRule>,

    /// Jurisdiction name → assumptions; names match case-insensitively and
    /// jurisdictions not listed use the defaults
    #[serde(default)]
    pub housing_assumptions: BTreeMap<String, HousingAssumptions>,

    #[serde(default)]
    pub block_group_overrides: Vec<BlockGroupOverride>,

    #[serde(default = "default_allocation_tolerance")]
    pub allocation_tolerance: f64,

    #[serde(default)]
    pub distribute_evenly_when_empty: bool,

    pub inputs: InputPaths,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_control_level() -> GeographyLevel {
    GeographyLevel::Taz
}

fn default_job_categories() -> Vec<String> {
    JOB_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

fn default_job_total() -> String {
    JOB_TOTAL.to_string()
}

fn default_household_column() -> String {
    HOUSEHOLD_COLUMN.to_string()
}

fn default_job_rounding() -> RoundingStrategy {
    RoundingStrategy::RandomBatch
}

fn default_allocation_tolerance() -> f64 {
    1e-6
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl PipelineConfig {
    /// Config with defaults for everything but the seed, year and parcel file
    pub fn new(seed: u64, horizon_year: i32, parcels: PathBuf) -> Self {
        PipelineConfig {
            seed,
            horizon_year,
            interpolation: None,
            control_level: default_control_level(),
            job_categories: default_job_categories(),
            job_total: default_job_total(),
            household_column: default_household_column(),
            job_rounding: default_job_rounding(),
            household_rounding: RoundingStrategy::default(),
            rules: Vec::new(),
            housing_assumptions: BTreeMap::new(),
            block_group_overrides: Vec::new(),
            allocation_tolerance: default_allocation_tolerance(),
            distribute_evenly_when_empty: false,
            inputs: InputPaths {
                parcels,
                ..InputPaths::default()
            },
            output_dir: default_output_dir(),
        }
    }

    /// Load and validate a config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: PipelineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.normalize_jurisdictions();

        config.validate().context("Invalid pipeline config")?;
        Ok(config)
    }

    /// Fail on the first rule with an unusable scale method
    pub fn validate(&self) -> std::result::Result<(), LandUseError> {
        for rule in &self.rules {
            let method = rule.method()?;
            if rule.dwelling_units && (method == ScaleMethod::KeepAsIs || rule.subject != Subject::Households) {
                return Err(LandUseError::InvalidScaleMethod {
                    method: rule.scale_method.clone(),
                    reason: format!(
                        "dwelling-unit input for {} needs household controls",
                        rule.jurisdiction
                    ),
                });
            }
            if method == ScaleMethod::ByCategory && rule.subject == Subject::Households {
                return Err(LandUseError::InvalidScaleMethod {
                    method: rule.scale_method.clone(),
                    reason: "households have a single category".to_string(),
                });
            }
        }
        if let Some(interp) = &self.interpolation {
            if interp.left_year >= interp.right_year {
                return Err(LandUseError::InvalidSnapshotYears {
                    left: interp.left_year,
                    right: interp.right_year,
                });
            }
        }
        Ok(())
    }

    pub fn job_set(&self) -> CategorySet {
        CategorySet {
            components: self.job_categories.clone(),
            total: Some(self.job_total.clone()),
        }
    }

    pub fn household_set(&self) -> CategorySet {
        CategorySet::new(&[self.household_column.as_str()], None)
    }

    pub fn categories(&self, subject: Subject) -> CategorySet {
        match subject {
            Subject::Jobs => self.job_set(),
            Subject::Households => self.household_set(),
        }
    }

    pub fn rounding_strategy(&self, subject: Subject) -> RoundingStrategy {
        match subject {
            Subject::Jobs => self.job_rounding,
            Subject::Households => self.household_rounding,
        }
    }

    /// Re-key housing assumptions by trimmed upper-case jurisdiction name
    pub fn normalize_jurisdictions(&mut self) {
        self.housing_assumptions = std::mem::take(&mut self.housing_assumptions)
            .into_iter()
            .map(|(name, assumptions)| (name.trim().to_uppercase(), assumptions))
            .collect();
    }

    pub fn assumptions_for(&self, jurisdiction: &str) -> HousingAssumptions {
        let wanted = jurisdiction.trim().to_uppercase();
        self.housing_assumptions
            .get(&wanted)
            .or_else(|| {
                self.housing_assumptions
                    .iter()
                    .find(|(name, _)| name.trim().to_uppercase() == wanted)
                    .map(|(_, assumptions)| assumptions)
            })
            .copied()
            .unwrap_or_default()
    }
}
