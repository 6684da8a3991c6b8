// 🗺️ Geographic Hierarchy
// Static lookup: parcel → TAZ, block group, jurisdiction
//
// Every stage groups parcels through this lookup. Group keys are ordered
// (BTreeMap) so per-group loops always run in the same order.

use crate::error::{LandUseError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub type ParcelId = i64;
pub type TazId = i64;
pub type BlockGroupId = i64;

// ============================================================================
// LEVELS AND KEYS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeographyLevel {
    Parcel,
    Taz,
    BlockGroup,
    Jurisdiction,
}

impl GeographyLevel {
    pub fn name(&self) -> &str {
        match self {
            GeographyLevel::Parcel => "parcel",
            GeographyLevel::Taz => "TAZ",
            GeographyLevel::BlockGroup => "block group",
            GeographyLevel::Jurisdiction => "jurisdiction",
        }
    }
}

impl fmt::Display for GeographyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Key of one group at some level: numeric for parcels, TAZs and block
/// groups, a normalized (upper-case) name for jurisdictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeoKey {
    Id(i64),
    Name(String),
}

impl GeoKey {
    pub fn jurisdiction(name: &str) -> Self {
        GeoKey::Name(name.trim().to_uppercase())
    }

    /// Parse a key read from a control file: integers become ids, anything
    /// else a jurisdiction name
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(id) => GeoKey::Id(id),
            Err(_) => GeoKey::jurisdiction(trimmed),
        }
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoKey::Id(id) => write!(f, "{}", id),
            GeoKey::Name(name) => write!(f, "{}", name),
        }
    }
}

// ============================================================================
// PARCEL GEOGRAPHY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelGeography {
    pub taz_id: TazId,
    pub block_group_id: BlockGroupId,
    pub jurisdiction: String,
}

impl ParcelGeography {
    pub fn key(&self, parcel_id: ParcelId, level: GeographyLevel) -> GeoKey {
        match level {
            GeographyLevel::Parcel => GeoKey::Id(parcel_id),
            GeographyLevel::Taz => GeoKey::Id(self.taz_id),
            GeographyLevel::BlockGroup => GeoKey::Id(self.block_group_id),
            GeographyLevel::Jurisdiction => GeoKey::jurisdiction(&self.jurisdiction),
        }
    }
}

// ============================================================================
// HIERARCHY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GeographicHierarchy {
    parcels: HashMap<ParcelId, ParcelGeography>,
}

impl GeographicHierarchy {
    pub fn new() -> Self {
        GeographicHierarchy {
            parcels: HashMap::new(),
        }
    }

    pub fn insert(&mut self, parcel_id: ParcelId, geography: ParcelGeography) {
        self.parcels.insert(parcel_id, geography);
    }

    pub fn len(&self) -> usize {
        self.parcels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty()
    }

    pub fn contains(&self, parcel_id: ParcelId) -> bool {
        self.parcels.contains_key(&parcel_id)
    }

    pub fn get(&self, parcel_id: ParcelId) -> Result<&ParcelGeography> {
        self.parcels
            .get(&parcel_id)
            .ok_or(LandUseError::UnknownParcel { parcel_id })
    }

    /// Mutable access for override rules
    pub(crate) fn get_mut(&mut self, parcel_id: ParcelId) -> Option<&mut ParcelGeography> {
        self.parcels.get_mut(&parcel_id)
    }

    pub fn key(&self, parcel_id: ParcelId, level: GeographyLevel) -> Result<GeoKey> {
        Ok(self.get(parcel_id)?.key(parcel_id, level))
    }

    pub fn block_group(&self, parcel_id: ParcelId) -> Result<BlockGroupId> {
        Ok(self.get(parcel_id)?.block_group_id)
    }

    /// Group parcel ids by their key at `level`; ids keep their input order
    /// within a group
    pub fn group<I>(&self, parcel_ids: I, level: GeographyLevel) -> Result<BTreeMap<GeoKey, Vec<ParcelId>>>
    where
        I: IntoIterator<Item = ParcelId>,
    {
        let mut groups: BTreeMap<GeoKey, Vec<ParcelId>> = BTreeMap::new();
        for parcel_id in parcel_ids {
            let key = self.key(parcel_id, level)?;
            groups.entry(key).or_default().push(parcel_id);
        }
        Ok(groups)
    }

    /// Map each `finer` group to its single `coarser` parent.
    ///
    /// Fails with `NonNestedHierarchy` when a finer group has parcels in two
    /// different coarser groups.
    pub fn parent_map<I>(
        &self,
        parcel_ids: I,
        finer: GeographyLevel,
        coarser: GeographyLevel,
    ) -> Result<BTreeMap<GeoKey, GeoKey>>
    where
        I: IntoIterator<Item = ParcelId>,
    {
        let mut parents: BTreeMap<GeoKey, GeoKey> = BTreeMap::new();
        for parcel_id in parcel_ids {
            let geography = self.get(parcel_id)?;
            let child = geography.key(parcel_id, finer);
            let parent = geography.key(parcel_id, coarser);
            match parents.get(&child) {
                Some(existing) if *existing != parent => {
                    return Err(LandUseError::NonNestedHierarchy {
                        finer,
                        coarser,
                        key: child,
                    });
                }
                Some(_) => {}
                None => {
                    parents.insert(child, parent);
                }
            }
        }
        Ok(parents)
    }
}

// ============================================================================
// SEEDED RANDOMNESS PER GROUP
// ============================================================================

/// Derive an RNG for one group from the run seed.
///
/// The stream depends only on (seed, stage, level, key), never on which
/// groups were processed before, so group order cannot change the output.
pub fn group_rng(seed: u64, stage: &str, level: GeographyLevel, key: &GeoKey) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(stage.as_bytes());
    hasher.update([0u8]);
    hasher.update(level.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(key.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    StdRng::from_seed(bytes)
}
