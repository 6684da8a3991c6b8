// ⚖️ Control Reconciler - Validate group sums match their controls
// Crosscheck run after a stage: for every controlled group
//
//   Σ parcel values in group = control total
//
// Each group gets its own result so no discrepancy is aggregated away.

use crate::error::Result;
use crate::geography::{GeoKey, GeographicHierarchy, GeographyLevel};
use crate::records::ParcelTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Group sum matches the control
    Balanced { control_total: f64, actual_total: f64 },

    /// Off by less than the major threshold
    MinorDiscrepancy {
        control_total: f64,
        actual_total: f64,
        difference: f64,
        tolerance: f64,
    },

    /// Off by the major threshold or more
    MajorDiscrepancy {
        control_total: f64,
        actual_total: f64,
        difference: f64,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    pub fn difference(&self) -> f64 {
        match self {
            ReconciliationResult::Balanced { .. } => 0.0,
            ReconciliationResult::MinorDiscrepancy { difference, .. } => *difference,
            ReconciliationResult::MajorDiscrepancy { difference, .. } => *difference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReconciliation {
    pub key: GeoKey,
    pub parcel_count: usize,
    pub result: ReconciliationResult,
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Pipeline stage the report was taken after
    pub stage: String,
    pub column: String,
    pub level: GeographyLevel,
    pub groups: Vec<GroupReconciliation>,
    pub discrepancies: Vec<Discrepancy>,
    pub reconciled_at: chrono::DateTime<chrono::Utc>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn balanced_count(&self) -> usize {
        self.groups.iter().filter(|g| g.result.is_balanced()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation after {} ({} by {}): {} groups, {} balanced, {} discrepancies",
            self.stage,
            self.column,
            self.level,
            self.groups.len(),
            self.balanced_count(),
            self.discrepancies.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub key: GeoKey,
    pub description: String,
    pub amount: f64,
    pub category: DiscrepancyCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    /// Group sum differs from its control
    TotalMismatch,
    /// Control names a group with no parcels
    MissingGroup,
}

// ============================================================================
// CONTROL RECONCILER
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ControlReconciler {
    /// Tolerance for floating-point comparisons (default: 1e-6)
    pub tolerance: f64,

    /// Threshold for minor vs major discrepancy (default: 10 units)
    pub major_discrepancy_threshold: f64,
}

impl ControlReconciler {
    pub fn new() -> Self {
        ControlReconciler {
            tolerance: 1e-6,
            major_discrepancy_threshold: 10.0,
        }
    }

    pub fn with_thresholds(tolerance: f64, major_threshold: f64) -> Self {
        ControlReconciler {
            tolerance,
            major_discrepancy_threshold: major_threshold,
        }
    }

    /// Compare `column` summed by `level` against `controls`.
    ///
    /// Groups without a control are not reported.
    pub fn reconcile(
        &self,
        stage: &str,
        table: &ParcelTable,
        column: &str,
        level: GeographyLevel,
        hierarchy: &GeographicHierarchy,
        controls: &BTreeMap<GeoKey, f64>,
    ) -> Result<ReconciliationReport> {
        table.require_columns(&[column], "reconciliation input")?;
        let sums = table.sum_by(column, level, hierarchy)?;
        let counts = hierarchy.group(table.parcel_ids(), level)?;

        let mut groups = Vec::new();
        let mut discrepancies = Vec::new();

        for (key, control_total) in controls {
            let Some(actual_total) = sums.get(key).copied() else {
                if *control_total != 0.0 {
                    discrepancies.push(Discrepancy {
                        key: key.clone(),
                        description: format!("{} {} has a control of {} but no parcels", level, key, control_total),
                        amount: *control_total,
                        category: DiscrepancyCategory::MissingGroup,
                    });
                }
                continue;
            };

            let result = self.classify(*control_total, actual_total);
            if let Some(discrepancy) = self.detect_discrepancy(key, &result) {
                discrepancies.push(discrepancy);
            }
            groups.push(GroupReconciliation {
                key: key.clone(),
                parcel_count: counts.get(key).map(|ids| ids.len()).unwrap_or(0),
                result,
            });
        }

        let report = ReconciliationReport {
            stage: stage.to_string(),
            column: column.to_string(),
            level,
            groups,
            discrepancies,
            reconciled_at: chrono::Utc::now(),
        };
        if report.is_balanced() {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }

    fn classify(&self, control_total: f64, actual_total: f64) -> ReconciliationResult {
        let difference = (actual_total - control_total).abs();

        if difference < self.tolerance {
            ReconciliationResult::Balanced {
                control_total,
                actual_total,
            }
        } else if difference < self.major_discrepancy_threshold {
            ReconciliationResult::MinorDiscrepancy {
                control_total,
                actual_total,
                difference,
                tolerance: self.tolerance,
            }
        } else {
            ReconciliationResult::MajorDiscrepancy {
                control_total,
                actual_total,
                difference,
            }
        }
    }

    fn detect_discrepancy(&self, key: &GeoKey, result: &ReconciliationResult) -> Option<Discrepancy> {
        if result.is_balanced() {
            return None;
        }
        Some(Discrepancy {
            key: key.clone(),
            description: format!("Group {} off by {:.2}", key, result.difference()),
            amount: result.difference(),
            category: DiscrepancyCategory::TotalMismatch,
        })
    }
}

impl Default for ControlReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ParcelRecord;

    fn table(rows: &[(i64, i64, f64)]) -> ParcelTable {
        let records = rows
            .iter()
            .map(|(id, taz, hh)| ParcelRecord::new(*id, *taz, 10, "Tacoma").with_count("HH_P", *hh))
            .collect();
        ParcelTable::new(vec!["HH_P".to_string()], records)
    }

    fn reconcile(rows: &[(i64, i64, f64)], controls: &[(i64, f64)]) -> ReconciliationReport {
        let t = table(rows);
        let controls = controls.iter().map(|(k, v)| (GeoKey::Id(*k), *v)).collect();
        ControlReconciler::new()
            .reconcile("rounding", &t, "HH_P", GeographyLevel::Taz, &t.hierarchy(), &controls)
            .unwrap()
    }

    #[test]
    fn test_reconciliation_balanced() {
        let report = reconcile(&[(1, 1, 2.0), (2, 1, 3.0)], &[(1, 5.0)]);

        assert!(report.is_balanced());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].parcel_count, 2);
        println!("✅ {}", report.summary());
    }

    #[test]
    fn test_reconciliation_minor_discrepancy() {
        let report = reconcile(&[(1, 1, 2.0), (2, 1, 3.0)], &[(1, 6.0)]);

        assert!(!report.is_balanced());
        assert!(matches!(
            report.groups[0].result,
            ReconciliationResult::MinorDiscrepancy { .. }
        ));
        assert_eq!(report.discrepancies[0].category, DiscrepancyCategory::TotalMismatch);
        assert_eq!(report.discrepancies[0].amount, 1.0);
    }

    #[test]
    fn test_reconciliation_major_discrepancy() {
        let report = reconcile(&[(1, 1, 2.0)], &[(1, 50.0)]);

        assert!(matches!(
            report.groups[0].result,
            ReconciliationResult::MajorDiscrepancy { .. }
        ));
        assert_eq!(report.groups[0].result.difference(), 48.0);
    }

    #[test]
    fn test_controlled_group_without_parcels() {
        let report = reconcile(&[(1, 1, 2.0)], &[(1, 2.0), (9, 4.0), (10, 0.0)]);

        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].category, DiscrepancyCategory::MissingGroup);
        assert_eq!(report.discrepancies[0].key, GeoKey::Id(9));
    }
}
