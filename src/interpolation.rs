// 📈 Interpolation between snapshot years
// value = left + ratio × (right - left),  ratio = (target - left_year) / (right_year - left_year)
//
// ratio outside [0, 1] is extrapolation. It is allowed here; callers decide
// whether to log it. Totals are always recomputed from components.

use crate::error::{LandUseError, Result, Warning};
use crate::geography::{group_rng, GeoKey, GeographicHierarchy, GeographyLevel, ParcelId};
use crate::records::{
    CategorySet, HouseholdRecord, ParcelRecord, ParcelTable, HOUSEHOLD_COLUMN, PERSON_COLUMN,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

// ============================================================================
// RATIO
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterpolationRatio {
    pub left_year: i32,
    pub right_year: i32,
    pub target_year: i32,
    pub ratio: f64,
}

impl InterpolationRatio {
    pub fn new(left_year: i32, right_year: i32, target_year: i32) -> Result<Self> {
        if left_year >= right_year {
            return Err(LandUseError::InvalidSnapshotYears {
                left: left_year,
                right: right_year,
            });
        }
        let ratio = (target_year - left_year) as f64 / (right_year - left_year) as f64;
        Ok(InterpolationRatio {
            left_year,
            right_year,
            target_year,
            ratio,
        })
    }

    pub fn is_extrapolation(&self) -> bool {
        self.ratio < 0.0 || self.ratio > 1.0
    }

    /// Bookends are returned as-is so ratio 0 and 1 reproduce their snapshot
    pub fn apply(&self, left: f64, right: f64) -> f64 {
        if self.ratio == 0.0 {
            left
        } else if self.ratio == 1.0 {
            right
        } else {
            left + self.ratio * (right - left)
        }
    }
}

// ============================================================================
// PARCEL INTERPOLATION
// ============================================================================

/// How parcels present in only one snapshot are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Keep parcels present in both snapshots only
    #[default]
    Inner,
    /// Keep every parcel; the missing side counts as zero
    Outer,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub year: i32,
    pub table: &'a ParcelTable,
}

impl<'a> Snapshot<'a> {
    pub fn new(year: i32, table: &'a ParcelTable) -> Self {
        Snapshot { year, table }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpolated {
    pub table: ParcelTable,
    pub ratio: InterpolationRatio,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Copy)]
pub struct Interpolator {
    pub join: JoinPolicy,
    /// Round interpolated values to the nearest integer (half to even)
    pub round_to_integer: bool,
}

impl Interpolator {
    pub fn new() -> Self {
        Interpolator {
            join: JoinPolicy::Inner,
            round_to_integer: true,
        }
    }

    pub fn with_join(join: JoinPolicy) -> Self {
        Interpolator {
            join,
            ..Interpolator::new()
        }
    }

    /// Interpolate `categories` for `target_year`.
    ///
    /// Non-interpolated columns and geography come from the left snapshot
    /// (right, for parcels only the right snapshot has).
    pub fn interpolate(
        &self,
        left: Snapshot<'_>,
        right: Snapshot<'_>,
        target_year: i32,
        categories: &CategorySet,
    ) -> Result<Interpolated> {
        let ratio = InterpolationRatio::new(left.year, right.year, target_year)?;
        let components: Vec<&str> = categories.components.iter().map(|c| c.as_str()).collect();
        left.table
            .require_columns(&components, &format!("{} snapshot", left.year))?;
        right.table
            .require_columns(&components, &format!("{} snapshot", right.year))?;
        left.table.require_unique_ids()?;
        right.table.require_unique_ids()?;

        info!(
            left_year = left.year,
            right_year = right.year,
            target_year,
            ratio = ratio.ratio,
            "interpolating parcels"
        );

        let right_index = right.table.index();
        let mut records = Vec::with_capacity(left.table.len());
        let mut warnings = Vec::new();
        let mut dropped = 0usize;

        for left_record in &left.table.records {
            let right_record = right_index
                .get(&left_record.parcel_id)
                .map(|&i| &right.table.records[i]);
            match (right_record, self.join) {
                (Some(r), _) => records.push(self.blend(left_record, Some(r), left_record, &ratio, categories, &mut warnings)),
                (None, JoinPolicy::Outer) => records.push(self.blend(left_record, None, left_record, &ratio, categories, &mut warnings)),
                (None, JoinPolicy::Inner) => dropped += 1,
            }
        }

        if self.join == JoinPolicy::Outer {
            let left_index = left.table.index();
            for right_record in &right.table.records {
                if !left_index.contains_key(&right_record.parcel_id) {
                    let zero = zeroed(right_record, categories);
                    records.push(self.blend(&zero, Some(right_record), right_record, &ratio, categories, &mut warnings));
                }
            }
        }

        if dropped > 0 {
            debug!(dropped, "parcels missing from right snapshot were dropped");
        }

        let mut columns = left.table.columns.clone();
        for column in categories.columns() {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }
        let mut table = ParcelTable::new(columns, records);
        table.recompute_totals(categories);

        Ok(Interpolated {
            table,
            ratio,
            warnings,
        })
    }

    fn blend(
        &self,
        left: &ParcelRecord,
        right: Option<&ParcelRecord>,
        base: &ParcelRecord,
        ratio: &InterpolationRatio,
        categories: &CategorySet,
        warnings: &mut Vec<Warning>,
    ) -> ParcelRecord {
        let mut out = base.clone();
        for column in &categories.components {
            let l = left.get(column);
            let r = right.map(|rec| rec.get(column)).unwrap_or(0.0);
            let mut value = ratio.apply(l, r);
            if self.round_to_integer {
                value = value.round_ties_even();
            }
            if value < 0.0 {
                warnings.push(Warning::NegativeInterpolatedValue {
                    parcel_id: base.parcel_id,
                    column: column.clone(),
                    value,
                });
                value = 0.0;
            }
            out.set(column, value);
        }
        out.recompute_total(categories);
        out
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

fn zeroed(record: &ParcelRecord, categories: &CategorySet) -> ParcelRecord {
    let mut zero = record.clone();
    for column in &categories.components {
        zero.set(column, 0.0);
    }
    zero
}

// ============================================================================
// HOUSEHOLD SNAPSHOTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelHouseholdTotals {
    pub parcel_id: ParcelId,
    pub households: f64,
    pub persons: f64,
}

fn totals_by_parcel(households: &[HouseholdRecord]) -> BTreeMap<ParcelId, (f64, f64)> {
    let mut totals: BTreeMap<ParcelId, (f64, f64)> = BTreeMap::new();
    let mut unplaced = 0usize;
    for hh in households {
        match hh.parcel_id {
            Some(parcel_id) => {
                let entry = totals.entry(parcel_id).or_insert((0.0, 0.0));
                entry.0 += hh.expansion_factor;
                entry.1 += hh.persons();
            }
            None => unplaced += 1,
        }
    }
    if unplaced > 0 {
        warn!(unplaced, "households without a parcel were skipped");
    }
    totals
}

/// Fractional household and person totals per parcel for the target year,
/// outer-joined over both snapshots
pub fn interpolate_household_totals(
    left: &[HouseholdRecord],
    right: &[HouseholdRecord],
    ratio: &InterpolationRatio,
) -> Vec<ParcelHouseholdTotals> {
    let left_totals = totals_by_parcel(left);
    let right_totals = totals_by_parcel(right);

    let mut parcel_ids: Vec<ParcelId> = left_totals.keys().chain(right_totals.keys()).copied().collect();
    parcel_ids.sort_unstable();
    parcel_ids.dedup();

    parcel_ids
        .into_iter()
        .map(|parcel_id| {
            let (lh, lp) = left_totals.get(&parcel_id).copied().unwrap_or((0.0, 0.0));
            let (rh, rp) = right_totals.get(&parcel_id).copied().unwrap_or((0.0, 0.0));
            ParcelHouseholdTotals {
                parcel_id,
                households: ratio.apply(lh, rh).max(0.0),
                persons: ratio.apply(lp, rp).max(0.0),
            }
        })
        .collect()
}

/// Household/person totals as a parcel table over every parcel of the
/// hierarchy; parcels without households get zeros
pub fn household_totals_table(
    totals: &[ParcelHouseholdTotals],
    hierarchy: &GeographicHierarchy,
    parcel_ids: &[ParcelId],
) -> Result<ParcelTable> {
    let by_parcel: HashMap<ParcelId, &ParcelHouseholdTotals> =
        totals.iter().map(|t| (t.parcel_id, t)).collect();

    let mut records = Vec::with_capacity(parcel_ids.len());
    for parcel_id in parcel_ids {
        let geography = hierarchy.get(*parcel_id)?;
        let (households, persons) = by_parcel
            .get(parcel_id)
            .map(|t| (t.households, t.persons))
            .unwrap_or((0.0, 0.0));
        records.push(
            ParcelRecord::new(*parcel_id, geography.taz_id, geography.block_group_id, &geography.jurisdiction)
                .with_count(HOUSEHOLD_COLUMN, households)
                .with_count(PERSON_COLUMN, persons),
        );
    }
    Ok(ParcelTable::new(
        vec![HOUSEHOLD_COLUMN.to_string(), PERSON_COLUMN.to_string()],
        records,
    ))
}

/// Pick future-year households per TAZ to meet interpolated TAZ targets.
///
/// Within a TAZ at most `min(target, available)` records are drawn without
/// replacement; shortfalls are logged. Output is ordered by household id.
pub fn select_households_for_targets(
    pool: &[HouseholdRecord],
    hierarchy: &GeographicHierarchy,
    targets: &BTreeMap<GeoKey, i64>,
    seed: u64,
) -> Result<Vec<HouseholdRecord>> {
    let mut by_taz: BTreeMap<GeoKey, Vec<&HouseholdRecord>> = BTreeMap::new();
    for hh in pool {
        if let Some(parcel_id) = hh.parcel_id {
            let key = hierarchy.key(parcel_id, GeographyLevel::Taz)?;
            by_taz.entry(key).or_default().push(hh);
        }
    }

    let mut selected: Vec<HouseholdRecord> = Vec::new();
    for (key, target) in targets {
        if *target <= 0 {
            continue;
        }
        let mut available = by_taz.remove(key).unwrap_or_default();
        available.sort_by_key(|hh| hh.household_id);

        let wanted = *target as usize;
        if available.len() < wanted {
            info!(taz = %key, target, available = available.len(), "fewer households than target");
        }
        let take = wanted.min(available.len());
        let mut rng = group_rng(seed, "household_selection", GeographyLevel::Taz, key);
        selected.extend(available.choose_multiple(&mut rng, take).map(|hh| (*hh).clone()));
    }

    selected.sort_by_key(|hh| hh.household_id);
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn categories() -> CategorySet {
        CategorySet::new(&["EMPEDU_P", "EMPRET_P"], Some("EMPTOT_P"))
    }

    fn table(rows: &[(i64, f64, f64)]) -> ParcelTable {
        let records = rows
            .iter()
            .map(|(id, edu, ret)| {
                ParcelRecord::new(*id, 1, 10, "Bellevue")
                    .with_count("EMPEDU_P", *edu)
                    .with_count("EMPRET_P", *ret)
                    .with_count("EMPTOT_P", -1.0)
            })
            .collect();
        ParcelTable::new(
            vec!["EMPEDU_P".into(), "EMPRET_P".into(), "EMPTOT_P".into()],
            records,
        )
    }

    #[test]
    fn test_duplicate_parcel_in_either_snapshot_fails() {
        let clean = table(&[(1, 1.0, 1.0), (2, 1.0, 1.0)]);
        let repeated = table(&[(1, 1.0, 1.0), (2, 1.0, 1.0), (2, 5.0, 0.0)]);
        let interp = Interpolator::new();

        for (left, right) in [(&repeated, &clean), (&clean, &repeated)] {
            let err = interp
                .interpolate(Snapshot::new(2020, left), Snapshot::new(2030, right), 2025, &categories())
                .unwrap_err();
            assert_eq!(err, LandUseError::DuplicateParcel { parcel_id: 2 });
        }
    }

    #[test]
    fn test_ratio_bookends_reproduce_snapshots() {
        let left = table(&[(1, 10.0, 4.0), (2, 0.0, 3.0)]);
        let right = table(&[(1, 20.0, 2.0), (2, 6.0, 9.0)]);
        let interp = Interpolator::new();

        let at_left = interp
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2020, &categories())
            .unwrap();
        let at_right = interp
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2030, &categories())
            .unwrap();

        let mut expected_left = left.clone();
        expected_left.recompute_totals(&categories());
        let mut expected_right = right.clone();
        expected_right.recompute_totals(&categories());

        assert_eq!(at_left.table, expected_left);
        assert_eq!(at_right.table, expected_right);
    }

    #[test]
    fn test_midpoint_rounds_and_recomputes_total() {
        let left = table(&[(1, 10.0, 4.0)]);
        let right = table(&[(1, 15.0, 1.0)]);
        let out = Interpolator::new()
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2025, &categories())
            .unwrap();

        let record = out.table.get(1).unwrap();
        assert_eq!(record.get("EMPEDU_P"), 12.0); // 12.5 → 12 (half to even)
        assert_eq!(record.get("EMPRET_P"), 2.0); // 2.5 → 2
        assert_eq!(record.get("EMPTOT_P"), 14.0);
        assert!(!out.ratio.is_extrapolation());
    }

    #[test]
    fn test_extrapolation_clamps_negative_values() {
        let left = table(&[(1, 10.0, 4.0)]);
        let right = table(&[(1, 2.0, 4.0)]);
        let out = Interpolator::new()
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2035, &categories())
            .unwrap();

        assert!(out.ratio.is_extrapolation());
        assert_eq!(out.table.get(1).unwrap().get("EMPEDU_P"), 0.0);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_join_policies() {
        let left = table(&[(1, 10.0, 0.0), (2, 4.0, 0.0)]);
        let right = table(&[(1, 20.0, 0.0), (3, 8.0, 0.0)]);

        let inner = Interpolator::with_join(JoinPolicy::Inner)
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2025, &categories())
            .unwrap();
        assert_eq!(inner.table.parcel_ids(), vec![1]);

        let outer = Interpolator::with_join(JoinPolicy::Outer)
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2025, &categories())
            .unwrap();
        assert_eq!(outer.table.parcel_ids(), vec![1, 2, 3]);
        assert_eq!(outer.table.get(2).unwrap().get("EMPEDU_P"), 2.0);
        assert_eq!(outer.table.get(3).unwrap().get("EMPEDU_P"), 4.0);
    }

    #[test]
    fn test_missing_category_column() {
        let left = table(&[(1, 1.0, 1.0)]);
        let right = ParcelTable::new(vec!["EMPEDU_P".into()], vec![]);
        let err = Interpolator::new()
            .interpolate(Snapshot::new(2020, &left), Snapshot::new(2030, &right), 2025, &categories())
            .unwrap_err();
        assert_eq!(err, LandUseError::missing_column("EMPRET_P", "2030 snapshot"));
    }

    #[test]
    fn test_invalid_snapshot_years() {
        assert!(matches!(
            InterpolationRatio::new(2030, 2030, 2030),
            Err(LandUseError::InvalidSnapshotYears { .. })
        ));
    }

    fn hh(id: i64, ef: f64, size: u32, parcel: i64) -> HouseholdRecord {
        let mut record = HouseholdRecord::new(id, ef, size, 100);
        record.parcel_id = Some(parcel);
        record
    }

    #[test]
    fn test_household_totals_outer_join() {
        let left = vec![hh(1, 1.0, 2, 10), hh(2, 1.0, 4, 10)];
        let right = vec![hh(3, 1.0, 3, 10), hh(4, 1.0, 1, 11), hh(5, 1.0, 1, 11)];
        let ratio = InterpolationRatio::new(2020, 2030, 2025).unwrap();

        let totals = interpolate_household_totals(&left, &right, &ratio);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].parcel_id, 10);
        assert_eq!(totals[0].households, 1.5);
        assert_eq!(totals[0].persons, 4.5);
        assert_eq!(totals[1].households, 1.0);
    }

    #[test]
    fn test_select_households_for_targets() {
        let mut hierarchy = GeographicHierarchy::new();
        hierarchy.insert(10, crate::geography::ParcelGeography { taz_id: 1, block_group_id: 100, jurisdiction: "A".into() });
        hierarchy.insert(11, crate::geography::ParcelGeography { taz_id: 2, block_group_id: 100, jurisdiction: "A".into() });

        let pool: Vec<HouseholdRecord> = (1..=6).map(|i| hh(i, 1.0, 2, if i <= 4 { 10 } else { 11 })).collect();
        let mut targets = BTreeMap::new();
        targets.insert(GeoKey::Id(1), 3);
        targets.insert(GeoKey::Id(2), 5);

        let a = select_households_for_targets(&pool, &hierarchy, &targets, 17).unwrap();
        let b = select_households_for_targets(&pool, &hierarchy, &targets, 17).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5); // 3 from TAZ 1, all 2 from TAZ 2
        assert_eq!(a.iter().filter(|h| h.parcel_id == Some(11)).count(), 2);
    }

    proptest! {
        #[test]
        fn prop_monotonic_between_bookends(
            l in 0u32..1000,
            r in 0u32..1000,
            y1 in 2020i32..2050,
            y2 in 2020i32..2050,
        ) {
            let (early, late) = (y1.min(y2), y1.max(y2));
            let left = table(&[(1, l as f64, 0.0)]);
            let right = table(&[(1, r as f64, 0.0)]);
            let interp = Interpolator::new();
            let at = |year| interp
                .interpolate(Snapshot::new(2020, &left), Snapshot::new(2050, &right), year, &categories())
                .unwrap()
                .table
                .get(1)
                .unwrap()
                .get("EMPEDU_P");
            let (a, b) = (at(early), at(late));
            if r >= l {
                prop_assert!(a <= b);
            } else {
                prop_assert!(a >= b);
            }
        }
    }
}
