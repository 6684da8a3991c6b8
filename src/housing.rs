// 🏠 Housing assumptions
// Dwelling units → occupied households → persons, per jurisdiction

use crate::geography::{GeoKey, GeographyLevel};
use crate::records::{ControlTable, ControlTotal, HOUSEHOLD_COLUMN, PERSON_COLUMN};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HousingAssumptions {
    /// Persons per single-family household
    pub sf_household_size: f64,
    /// Persons per multi-family household
    pub mf_household_size: f64,
    /// Share of single-family units occupied
    pub sf_occupancy: f64,
    /// Share of multi-family units occupied
    pub mf_occupancy: f64,
}

impl Default for HousingAssumptions {
    fn default() -> Self {
        HousingAssumptions {
            sf_household_size: 2.82,
            mf_household_size: 2.03,
            sf_occupancy: 0.952,
            mf_occupancy: 0.895,
        }
    }
}

impl HousingAssumptions {
    pub fn households(&self, sf_units: f64, mf_units: f64) -> f64 {
        sf_units * self.sf_occupancy + mf_units * self.mf_occupancy
    }

    pub fn persons(&self, sf_units: f64, mf_units: f64) -> f64 {
        sf_units * self.sf_occupancy * self.sf_household_size
            + mf_units * self.mf_occupancy * self.mf_household_size
    }
}

/// Dwelling-unit counts supplied for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellingUnits {
    pub key: GeoKey,
    pub sf_units: f64,
    pub mf_units: f64,
}

/// Household and person controls from dwelling-unit counts
pub fn household_controls(
    level: GeographyLevel,
    units: &[DwellingUnits],
    assumptions: &HousingAssumptions,
) -> ControlTable {
    let mut table = ControlTable::new(level);
    for row in units {
        table.insert(
            ControlTotal::new(row.key.clone())
                .with_total(HOUSEHOLD_COLUMN, assumptions.households(row.sf_units, row.mf_units))
                .with_total(PERSON_COLUMN, assumptions.persons(row.sf_units, row.mf_units)),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_households_from_units() {
        let a = HousingAssumptions::default();
        let hh = a.households(100.0, 200.0);
        assert!((hh - (95.2 + 179.0)).abs() < 1e-9);

        let persons = a.persons(100.0, 0.0);
        assert!((persons - 95.2 * 2.82).abs() < 1e-9);
    }

    #[test]
    fn test_household_controls_table() {
        let units = vec![
            DwellingUnits { key: GeoKey::Id(7), sf_units: 10.0, mf_units: 0.0 },
            DwellingUnits { key: GeoKey::Id(8), sf_units: 0.0, mf_units: 0.0 },
        ];
        let controls = household_controls(GeographyLevel::Taz, &units, &HousingAssumptions::default());

        assert_eq!(controls.len(), 2);
        assert!((controls.get(&GeoKey::Id(7), HOUSEHOLD_COLUMN).unwrap() - 9.52).abs() < 1e-9);
        assert_eq!(controls.get(&GeoKey::Id(8), PERSON_COLUMN), Some(0.0));
    }
}
