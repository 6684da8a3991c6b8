// 🎯 Controlled Rounding
// Round real-valued per-parcel counts to integers so that each group sums to an
// exact integer target, without ever producing a negative count.
//
//   diff = target - Σ naive_round(values)
//   |diff| single-unit adjustments are drawn tier by tier (seeded sampling),
//   decrements that a row cannot absorb are carried to the next row/tier.
//
// Two remainder policies exist and are kept as named strategies:
//   MultiUnitFirst - decrements hit rows ≥2 before rows ==1, increments the reverse
//   RandomBatch    - one random batch over all positive rows

use crate::error::{LandUseError, Result, Warning};
use crate::geography::{group_rng, GeoKey, GeographicHierarchy, GeographyLevel, ParcelId};
use crate::records::{CategorySet, ParcelTable};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// ============================================================================
// STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingStrategy {
    /// Prefer multi-unit parcels when removing units and single-unit parcels
    /// when adding, so single-unit parcels are neither erased nor created first
    #[default]
    MultiUnitFirst,

    /// Draw all adjustments in one batch from the group's positive rows
    RandomBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase,
    Decrease,
}

/// Row eligibility for one round of adjustments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// value >= 2
    MultiUnit,
    /// value == 1
    SingleUnit,
    /// value > 0
    Positive,
    /// any row of the group
    Any,
}

impl Tier {
    pub fn accepts(&self, value: i64) -> bool {
        match self {
            Tier::MultiUnit => value >= 2,
            Tier::SingleUnit => value == 1,
            Tier::Positive => value > 0,
            Tier::Any => true,
        }
    }
}

impl RoundingStrategy {
    /// Tiers tried in order for one direction
    pub fn tiers(&self, direction: Adjustment) -> &'static [Tier] {
        match (self, direction) {
            (RoundingStrategy::MultiUnitFirst, Adjustment::Decrease) => {
                &[Tier::MultiUnit, Tier::SingleUnit]
            }
            (RoundingStrategy::MultiUnitFirst, Adjustment::Increase) => {
                &[Tier::SingleUnit, Tier::MultiUnit, Tier::Any]
            }
            (RoundingStrategy::RandomBatch, Adjustment::Decrease) => &[Tier::Positive],
            (RoundingStrategy::RandomBatch, Adjustment::Increase) => &[Tier::Positive, Tier::Any],
        }
    }
}

/// Round half to even, clamped at zero
pub fn naive_round(value: f64) -> i64 {
    if !value.is_finite() || value <= 0.0 {
        0
    } else {
        value.round_ties_even() as i64
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRounding {
    pub values: Vec<i64>,
    /// target minus achieved sum; 0 when the group reconciled
    pub remaining: i64,
}

impl GroupRounding {
    pub fn is_resolved(&self) -> bool {
        self.remaining == 0
    }

    pub fn sum(&self) -> i64 {
        self.values.iter().sum()
    }
}

/// Integer column produced for one table column at one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundedColumn {
    pub column: String,
    pub level: GeographyLevel,
    pub values: BTreeMap<ParcelId, i64>,
    pub warnings: Vec<Warning>,
}

impl RoundedColumn {
    pub fn get(&self, parcel_id: ParcelId) -> Option<i64> {
        self.values.get(&parcel_id).copied()
    }

    pub fn total(&self) -> i64 {
        self.values.values().sum()
    }

    pub fn group_sums(&self, hierarchy: &GeographicHierarchy, level: GeographyLevel) -> Result<BTreeMap<GeoKey, i64>> {
        let mut sums: BTreeMap<GeoKey, i64> = BTreeMap::new();
        for (parcel_id, value) in &self.values {
            let key = hierarchy.key(*parcel_id, level)?;
            *sums.entry(key).or_insert(0) += *value;
        }
        Ok(sums)
    }

    /// Fresh table carrying the integer values in `column`
    pub fn apply_to(&self, table: &ParcelTable) -> ParcelTable {
        let values: BTreeMap<ParcelId, f64> = self
            .values
            .iter()
            .map(|(id, v)| (*id, *v as f64))
            .collect();
        table.with_column(&self.column, &values)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundedTable {
    pub table: ParcelTable,
    pub columns: Vec<RoundedColumn>,
    pub warnings: Vec<Warning>,
}

// ============================================================================
// CONTROLLED ROUNDER
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlledRounder {
    pub strategy: RoundingStrategy,
}

impl ControlledRounder {
    pub fn new(strategy: RoundingStrategy) -> Self {
        ControlledRounder { strategy }
    }

    /// Round one group's fractional values to integers summing to `target`
    pub fn round_group<R: Rng + ?Sized>(&self, values: &[f64], target: i64, rng: &mut R) -> GroupRounding {
        let integers = values.iter().map(|v| naive_round(*v)).collect();
        self.reconcile_group(integers, target, rng)
    }

    /// Adjust already-integral values until they sum to `target`
    pub fn reconcile_group<R: Rng + ?Sized>(&self, mut values: Vec<i64>, target: i64, rng: &mut R) -> GroupRounding {
        let current: i64 = values.iter().sum();
        let diff = target - current;
        if diff == 0 {
            return GroupRounding { values, remaining: 0 };
        }

        let direction = if diff > 0 {
            Adjustment::Increase
        } else {
            Adjustment::Decrease
        };
        let mut units = diff.unsigned_abs() as usize;

        for tier in self.strategy.tiers(direction) {
            if units == 0 {
                break;
            }
            let eligible: Vec<usize> = (0..values.len())
                .filter(|&i| tier.accepts(values[i]))
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let picks = draw_units(&eligible, units, rng);
            units = match direction {
                Adjustment::Increase => {
                    for (i, count) in picks {
                        values[i] += count;
                    }
                    0
                }
                Adjustment::Decrease => take_units(&mut values, &picks) as usize,
            };
        }

        if direction == Adjustment::Decrease && units > 0 {
            sweep_remainder(&mut values, units as i64);
        }

        let achieved: i64 = values.iter().sum();
        GroupRounding {
            values,
            remaining: target - achieved,
        }
    }

    /// Round `column` so every group at `level` sums to its target.
    ///
    /// Groups without a target keep their own rounded sum. Targets naming a
    /// group with no parcels are reported as unresolved.
    pub fn round_column(
        &self,
        table: &ParcelTable,
        column: &str,
        level: GeographyLevel,
        hierarchy: &GeographicHierarchy,
        targets: &BTreeMap<GeoKey, i64>,
        seed: u64,
    ) -> Result<RoundedColumn> {
        table.require_columns(&[column], "rounding input")?;
        table.require_unique_ids()?;

        let values = table.column_values(column);
        let groups = hierarchy.group(table.parcel_ids(), level)?;
        let stage = format!("controlled_rounding:{}", column);

        let mut out: BTreeMap<ParcelId, i64> = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut covered: BTreeSet<GeoKey> = BTreeSet::new();

        for (key, mut parcel_ids) in groups {
            parcel_ids.sort_unstable();
            let fractional: Vec<f64> = parcel_ids
                .iter()
                .map(|id| values.get(id).copied().unwrap_or(0.0))
                .collect();
            let target = match targets.get(&key) {
                Some(t) => *t,
                None => naive_round(fractional.iter().sum()),
            };

            let mut rng = group_rng(seed, &stage, level, &key);
            let rounded = self.round_group(&fractional, target, &mut rng);
            debug!(column, %level, group = %key, target, "group rounded");

            if !rounded.is_resolved() {
                warn!(column, %level, group = %key, remaining = rounded.remaining, "rounding remainder unresolved");
                warnings.push(Warning::UnresolvedRoundingRemainder {
                    column: column.to_string(),
                    level,
                    key: key.clone(),
                    remaining: rounded.remaining,
                });
            }
            out.extend(parcel_ids.into_iter().zip(rounded.values));
            covered.insert(key);
        }

        for (key, target) in targets {
            if !covered.contains(key) && *target != 0 {
                warn!(column, %level, group = %key, remaining = *target, "control target has no parcels");
                warnings.push(Warning::UnresolvedRoundingRemainder {
                    column: column.to_string(),
                    level,
                    key: key.clone(),
                    remaining: *target,
                });
            }
        }

        Ok(RoundedColumn {
            column: column.to_string(),
            level,
            values: out,
            warnings,
        })
    }

    /// Round every component of `categories`, each against its own targets,
    /// then recompute the derived total
    pub fn round_categories(
        &self,
        table: &ParcelTable,
        categories: &CategorySet,
        level: GeographyLevel,
        hierarchy: &GeographicHierarchy,
        targets: &BTreeMap<String, BTreeMap<GeoKey, i64>>,
        seed: u64,
    ) -> Result<RoundedTable> {
        let empty = BTreeMap::new();
        let mut current = table.clone();
        let mut columns = Vec::new();
        let mut warnings = Vec::new();

        for component in &categories.components {
            let component_targets = targets.get(component).unwrap_or(&empty);
            let rounded = self.round_column(&current, component, level, hierarchy, component_targets, seed)?;
            current = rounded.apply_to(&current);
            warnings.extend(rounded.warnings.iter().cloned());
            columns.push(rounded);
        }
        current.recompute_totals(categories);

        Ok(RoundedTable {
            table: current,
            columns,
            warnings,
        })
    }

    /// Round through nested levels, coarse to fine, so integer sums are exact
    /// at every level.
    ///
    /// Each coarser group's integer target is split over its children by
    /// rounding the children's fractional sums against it; the finest level's
    /// targets then drive the parcel rounding. With no levels every parcel is
    /// rounded on its own.
    pub fn round_nested(
        &self,
        table: &ParcelTable,
        column: &str,
        levels: &[GeographyLevel],
        hierarchy: &GeographicHierarchy,
        top_targets: &BTreeMap<GeoKey, i64>,
        seed: u64,
    ) -> Result<RoundedColumn> {
        let finest = match levels.last() {
            Some(level) => *level,
            None => {
                return self.round_column(table, column, GeographyLevel::Parcel, hierarchy, &BTreeMap::new(), seed)
            }
        };
        table.require_columns(&[column], "rounding input")?;

        let stage = format!("nested_rounding:{}", column);
        let mut targets = top_targets.clone();
        let mut warnings = Vec::new();

        for pair in levels.windows(2) {
            let (coarser, finer) = (pair[0], pair[1]);
            let parents = hierarchy.parent_map(table.parcel_ids(), finer, coarser)?;
            let finer_sums = table.sum_by(column, finer, hierarchy)?;

            let mut children: BTreeMap<GeoKey, Vec<(GeoKey, f64)>> = BTreeMap::new();
            for (child, sum) in finer_sums {
                let parent = parents
                    .get(&child)
                    .cloned()
                    .ok_or_else(|| LandUseError::NonNestedHierarchy {
                        finer,
                        coarser,
                        key: child.clone(),
                    })?;
                children.entry(parent).or_default().push((child, sum));
            }

            let mut next: BTreeMap<GeoKey, i64> = BTreeMap::new();
            for (parent, kids) in children {
                let sums: Vec<f64> = kids.iter().map(|(_, s)| *s).collect();
                let target = match targets.get(&parent) {
                    Some(t) => *t,
                    None => naive_round(sums.iter().sum()),
                };
                let mut rng = group_rng(seed, &stage, coarser, &parent);
                let split = self.round_group(&sums, target, &mut rng);
                if !split.is_resolved() {
                    warn!(column, level = %coarser, group = %parent, remaining = split.remaining, "nested split unresolved");
                    warnings.push(Warning::UnresolvedRoundingRemainder {
                        column: column.to_string(),
                        level: coarser,
                        key: parent.clone(),
                        remaining: split.remaining,
                    });
                }
                for ((child, _), value) in kids.into_iter().zip(split.values) {
                    next.insert(child, value);
                }
            }
            targets = next;
        }

        let mut rounded = self.round_column(table, column, finest, hierarchy, &targets, seed)?;
        warnings.append(&mut rounded.warnings);
        rounded.warnings = warnings;
        Ok(rounded)
    }
}

// ============================================================================
// ADJUSTMENT HELPERS
// ============================================================================

/// Pick `units` rows from `eligible`: without replacement when the tier has
/// enough rows, with replacement otherwise. Returns (row, times picked),
/// most-picked first.
fn draw_units<R: Rng + ?Sized>(eligible: &[usize], units: usize, rng: &mut R) -> Vec<(usize, i64)> {
    let mut counts: BTreeMap<usize, i64> = BTreeMap::new();
    if eligible.len() >= units {
        for &row in eligible.choose_multiple(rng, units) {
            *counts.entry(row).or_insert(0) += 1;
        }
    } else {
        for _ in 0..units {
            let row = eligible[rng.gen_range(0..eligible.len())];
            *counts.entry(row).or_insert(0) += 1;
        }
    }

    let mut picks: Vec<(usize, i64)> = counts.into_iter().collect();
    picks.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    picks
}

/// Apply decrements without going below zero. What a row cannot absorb is
/// carried to the next pick; leftovers get a second pass over rows that still
/// have units. Returns the units still owed.
fn take_units(values: &mut [i64], picks: &[(usize, i64)]) -> i64 {
    let mut carry = 0;
    let mut second_round = Vec::new();

    for &(row, count) in picks {
        let need = count + carry;
        if values[row] >= need {
            values[row] -= need;
            carry = 0;
            second_round.push(row);
        } else {
            carry = need - values[row];
            values[row] = 0;
        }
    }

    for row in second_round {
        if carry == 0 {
            break;
        }
        let take = values[row].min(carry);
        values[row] -= take;
        carry -= take;
    }
    carry
}

/// Last resort for decrements: largest rows first
fn sweep_remainder(values: &mut [i64], mut owed: i64) -> i64 {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].cmp(&values[a]).then(a.cmp(&b)));
    for row in order {
        if owed == 0 {
            break;
        }
        let take = values[row].min(owed);
        values[row] -= take;
        owed -= take;
    }
    owed
}

// ============================================================================
// TESTS
// ============================================================================
