// 🏘️ Allocator
// Place weighted household records on parcels so each parcel meets its
// integer household target, block group by block group
//
// Pass 1 walks parcels in ascending id with a single cursor over the block
// group's pool (households in ascending id). Each household is looked at once:
// it goes to the current parcel if it fits and is set aside otherwise, so no
// parcel is filled past its target.
// Pass 2 places the set-aside households by seeded random choice among parcels
// with open capacity.

use crate::error::{LandUseError, Result, Warning};
use crate::geography::{group_rng, BlockGroupId, GeoKey, GeographicHierarchy, GeographyLevel, ParcelId};
use crate::records::{HouseholdId, HouseholdRecord};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Slack when comparing fractional weights against integer targets
const EPS: f64 = 1e-9;

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelAssignment {
    pub parcel_id: ParcelId,
    pub target: i64,
    pub household_ids: Vec<HouseholdId>,
    pub weight: f64,
}

impl ParcelAssignment {
    fn new(parcel_id: ParcelId, target: i64) -> Self {
        ParcelAssignment {
            parcel_id,
            target,
            household_ids: Vec::new(),
            weight: 0.0,
        }
    }

    fn open_capacity(&self) -> f64 {
        self.target as f64 - self.weight
    }

    fn take(&mut self, household: &HouseholdRecord) {
        self.household_ids.push(household.household_id);
        self.weight += household.expansion_factor;
    }
}

/// Outcome for one block group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub block_group_id: BlockGroupId,
    /// Sum of the parcels' integer targets
    pub control_total: i64,
    pub pool_weight: f64,
    pub assigned_weight: f64,
    pub parcels: Vec<ParcelAssignment>,
}

impl AllocationResult {
    /// Every parcel landed exactly on its target
    pub fn reconciles(&self, tolerance: f64) -> bool {
        self.parcels
            .iter()
            .all(|p| (p.weight - p.target as f64).abs() <= tolerance)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Every input household with its parcel set, ordered by household id
    pub households: Vec<HouseholdRecord>,
    pub results: Vec<AllocationResult>,
    pub warnings: Vec<Warning>,
}

impl Allocation {
    pub fn reconciles(&self, tolerance: f64) -> bool {
        self.results.iter().all(|r| r.reconciles(tolerance))
    }

    /// Assigned weight per parcel
    pub fn parcel_weights(&self) -> BTreeMap<ParcelId, f64> {
        self.results
            .iter()
            .flat_map(|r| r.parcels.iter().map(|p| (p.parcel_id, p.weight)))
            .collect()
    }
}

// ============================================================================
// ALLOCATOR
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    /// Allowed |pool weight - control total| per block group
    pub tolerance: f64,
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator { tolerance: 1e-6 }
    }
}

impl Allocator {
    pub fn new(tolerance: f64) -> Self {
        Allocator { tolerance }
    }

    /// Assign every household to a parcel of its own block group.
    ///
    /// `targets` holds each parcel's integer household target; parcels are
    /// grouped through `hierarchy`, so block-group overrides must already be
    /// applied to it.
    pub fn allocate(
        &self,
        targets: &BTreeMap<ParcelId, i64>,
        hierarchy: &GeographicHierarchy,
        households: &[HouseholdRecord],
        seed: u64,
    ) -> Result<Allocation> {
        for hh in households {
            if !hh.expansion_factor.is_finite() || hh.expansion_factor < 0.0 {
                return Err(LandUseError::InvalidWeight {
                    household_id: hh.household_id,
                    weight: hh.expansion_factor,
                });
            }
        }

        let mut parcels_by_bg: BTreeMap<BlockGroupId, Vec<ParcelId>> = BTreeMap::new();
        for parcel_id in targets.keys() {
            parcels_by_bg
                .entry(hierarchy.block_group(*parcel_id)?)
                .or_default()
                .push(*parcel_id);
        }

        let mut pools: BTreeMap<BlockGroupId, Vec<&HouseholdRecord>> = BTreeMap::new();
        for hh in households {
            pools.entry(hh.block_group_id).or_default().push(hh);
        }
        for pool in pools.values_mut() {
            pool.sort_by_key(|hh| hh.household_id);
        }

        for (block_group, pool) in &pools {
            if !pool.is_empty() && !parcels_by_bg.contains_key(block_group) {
                return Err(LandUseError::NoParcelsInBlockGroup {
                    block_group: *block_group,
                });
            }
        }

        let mut placed: BTreeMap<HouseholdId, ParcelId> = BTreeMap::new();
        let mut results = Vec::with_capacity(parcels_by_bg.len());
        let mut warnings = Vec::new();
        let no_households = Vec::new();

        for (block_group, parcel_ids) in &parcels_by_bg {
            let pool = pools.get(block_group).unwrap_or(&no_households);
            let result = self.allocate_block_group(
                *block_group,
                parcel_ids,
                targets,
                pool,
                seed,
                &mut warnings,
            )?;
            for parcel in &result.parcels {
                for household_id in &parcel.household_ids {
                    placed.insert(*household_id, parcel.parcel_id);
                }
            }
            results.push(result);
        }

        let mut allocated: Vec<HouseholdRecord> = households
            .iter()
            .map(|hh| HouseholdRecord {
                parcel_id: placed.get(&hh.household_id).copied(),
                ..hh.clone()
            })
            .collect();
        allocated.sort_by_key(|hh| hh.household_id);

        info!(
            block_groups = results.len(),
            households = allocated.len(),
            overflows = warnings.len(),
            "households allocated"
        );
        Ok(Allocation {
            households: allocated,
            results,
            warnings,
        })
    }

    fn allocate_block_group(
        &self,
        block_group: BlockGroupId,
        parcel_ids: &[ParcelId],
        targets: &BTreeMap<ParcelId, i64>,
        pool: &[&HouseholdRecord],
        seed: u64,
        warnings: &mut Vec<Warning>,
    ) -> Result<AllocationResult> {
        let mut parcels: Vec<ParcelAssignment> = parcel_ids
            .iter()
            .map(|id| ParcelAssignment::new(*id, targets.get(id).copied().unwrap_or(0).max(0)))
            .collect();
        let control_total: i64 = parcels.iter().map(|p| p.target).sum();
        let pool_weight: f64 = pool.iter().map(|hh| hh.expansion_factor).sum();

        if (pool_weight - control_total as f64).abs() > self.tolerance {
            return Err(LandUseError::SupplyDemandMismatch {
                block_group,
                pool_weight,
                control_total: control_total as f64,
            });
        }

        // pass 1: fill parcels in id order
        let mut cursor = 0;
        let mut set_aside: Vec<&HouseholdRecord> = Vec::new();
        for parcel in parcels.iter_mut() {
            while cursor < pool.len() && parcel.open_capacity() > EPS {
                let hh = pool[cursor];
                if parcel.weight + hh.expansion_factor <= parcel.target as f64 + EPS {
                    parcel.take(hh);
                } else {
                    set_aside.push(hh);
                }
                cursor += 1;
            }
        }
        set_aside.extend_from_slice(&pool[cursor..]);

        // pass 2: leftovers go to a random parcel with room
        let key = GeoKey::Id(block_group);
        let mut rng = group_rng(seed, "allocation", GeographyLevel::BlockGroup, &key);
        let leftovers = set_aside.len();
        for hh in set_aside {
            let w = hh.expansion_factor;
            let mut candidates: Vec<usize> = (0..parcels.len())
                .filter(|&p| parcels[p].open_capacity() >= w - EPS)
                .collect();
            if candidates.is_empty() {
                candidates = (0..parcels.len())
                    .filter(|&p| parcels[p].open_capacity() > EPS)
                    .collect();
            }
            if candidates.is_empty() {
                candidates = (0..parcels.len()).filter(|&p| parcels[p].target > 0).collect();
            }
            if candidates.is_empty() {
                candidates = (0..parcels.len()).collect();
            }

            let Some(&choice) = candidates.choose(&mut rng) else {
                return Err(LandUseError::NoParcelsInBlockGroup { block_group });
            };
            let parcel = &mut parcels[choice];
            parcel.take(hh);

            if parcel.weight > parcel.target as f64 + EPS {
                warn!(block_group, household = hh.household_id, parcel = parcel.parcel_id, "household exceeds parcel capacity");
                warnings.push(Warning::CapacityOverflow {
                    block_group,
                    household_id: hh.household_id,
                    parcel_id: parcel.parcel_id,
                });
            }
        }

        let assigned_weight: f64 = parcels.iter().map(|p| p.weight).sum();
        debug!(block_group, control_total, pool_weight, leftovers, "block group allocated");

        Ok(AllocationResult {
            block_group_id: block_group,
            control_total,
            pool_weight,
            assigned_weight,
            parcels,
        })
    }
}
