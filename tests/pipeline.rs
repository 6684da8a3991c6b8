// End-to-end runs over CSV inputs written to a temp directory

use landuse_rounding::{io, GeoKey, LandUseError, Pipeline, PipelineConfig, PipelineOutput, RunReport};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PARCELS_2040: &str = "parcel_id,taz_id,block_group_id,jurisdiction,EMPEDU_P,EMPRET_P,HH_P
1,1,100,Bellevue,2,1,1
2,1,100,Bellevue,3,0,2
3,2,200,Redmond,1,1,0
4,2,201,Redmond,0,2,1
";

const PARCELS_2050: &str = "parcel_id,taz_id,block_group_id,jurisdiction,EMPEDU_P,EMPRET_P,HH_P
1,1,100,Bellevue,4,1,3
2,1,100,Bellevue,5,2,2
3,2,200,Redmond,3,1,2
4,2,201,Redmond,2,2,1
";

const BELLEVUE_JOBS: &str = "key,EMPTOT_P
1,12
";

const REDMOND_UNITS: &str = "key,sf_units,mf_units
2,2,1
";

const HOUSEHOLDS: &str = "household_id,expansion_factor,household_size,block_group_id
1,1,2,100
2,1,1,100
3,1,4,100
4,1,3,200
5,1,2,200
6,1,1,200
";

fn config_json(seed: u64) -> String {
    format!(
        r#"{{
        "seed": {seed},
        "horizon_year": 2045,
        "interpolation": {{"left_year": 2040, "right_year": 2050}},
        "job_categories": ["EMPEDU_P", "EMPRET_P"],
        "rules": [
            {{"jurisdiction": "Bellevue", "scale_method": "Scale_by_Total_Jobs_by_TAZ", "input": "bellevue_jobs.csv"}},
            {{"jurisdiction": "Redmond", "scale_method": "Scale_by_Total_Hhs_by_TAZ", "subject": "households",
              "input": "redmond_units.csv", "dwelling_units": true}}
        ],
        "block_group_overrides": [
            {{"from": 201, "to": 200, "only_positive": true, "reason": "survey gap"}}
        ],
        "inputs": {{
            "parcels": "parcels_2040.csv",
            "right_parcels": "parcels_2050.csv",
            "households": "households.csv"
        }},
        "output_dir": "out"
    }}"#
    )
}

fn setup(seed: u64, households: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let files = [
        ("parcels_2040.csv", PARCELS_2040),
        ("parcels_2050.csv", PARCELS_2050),
        ("bellevue_jobs.csv", BELLEVUE_JOBS),
        ("redmond_units.csv", REDMOND_UNITS),
        ("households.csv", households),
    ];
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    fs::write(dir.path().join("run.json"), config_json(seed)).unwrap();
    dir
}

fn run(dir: &Path) -> Result<PipelineOutput, LandUseError> {
    let config = PipelineConfig::from_file(dir.join("run.json")).unwrap();
    let inputs = io::load_inputs(&config, dir).unwrap();
    Pipeline::new(config).run(&inputs)
}

fn taz_sum(output: &PipelineOutput, taz: i64, column: &str) -> f64 {
    output
        .table
        .records
        .iter()
        .filter(|r| r.taz_id == taz)
        .map(|r| r.get(column))
        .sum()
}

#[test]
fn test_full_run_meets_controls_and_allocates() {
    let dir = setup(2024, HOUSEHOLDS);
    let output = run(dir.path()).unwrap();

    // every count is a non-negative integer
    for record in &output.table.records {
        for column in &output.table.columns {
            let value = record.get(column);
            assert!(value >= 0.0 && value.fract() == 0.0, "parcel {} {} = {}", record.parcel_id, column, value);
        }
    }

    assert_eq!(taz_sum(&output, 1, "EMPTOT_P"), 12.0);
    assert_eq!(taz_sum(&output, 2, "HH_P"), 3.0);
    assert!(output.report.reconciliations.iter().all(|r| r.is_balanced()));

    // parcel 4 moved to block group 200, where the Redmond households live
    assert_eq!(output.report.overrides_applied.len(), 1);
    let households = output.households();
    assert_eq!(households.len(), 6);
    for hh in households {
        let parcel = hh.parcel_id.unwrap();
        if hh.block_group_id == 200 {
            assert_eq!(parcel, 4);
        } else {
            assert!(parcel == 1 || parcel == 2);
        }
    }
    let allocation = output.allocation.as_ref().unwrap();
    assert!(allocation.reconciles(1e-9));
    let on_parcel_2 = households.iter().filter(|hh| hh.parcel_id == Some(2)).count();
    assert_eq!(on_parcel_2 as f64, output.table.get(2).unwrap().get("HH_P"));
}

#[test]
fn test_reruns_are_identical() {
    let first = setup(7, HOUSEHOLDS);
    let second = setup(7, HOUSEHOLDS);

    let a = run(first.path()).unwrap();
    let b = run(second.path()).unwrap();
    assert_eq!(a.report.digest, b.report.digest);
    assert_eq!(a.table, b.table);
    assert_eq!(a.households(), b.households());
}

#[test]
fn test_outputs_are_written() {
    let dir = setup(3, HOUSEHOLDS);
    let output = run(dir.path()).unwrap();
    let out_dir = dir.path().join("out");
    io::write_outputs(&out_dir, &output).unwrap();

    let parcels = io::load_parcels(&out_dir.join("rounded_parcels.csv")).unwrap();
    assert_eq!(parcels, output.table);

    let households = io::load_households(&out_dir.join("allocated_households.csv")).unwrap();
    assert_eq!(households.as_slice(), output.households());

    let report: RunReport =
        serde_json::from_str(&fs::read_to_string(out_dir.join("run_report.json")).unwrap()).unwrap();
    assert_eq!(report.digest, output.report.digest);
    assert_eq!(report.interpolation.unwrap().ratio, 0.5);
}

#[test]
fn test_household_pool_must_match_targets() {
    // one Bellevue household short
    let short = "household_id,expansion_factor,household_size,block_group_id
1,1,2,100
2,1,1,100
4,1,3,200
5,1,2,200
6,1,1,200
";
    let dir = setup(1, short);
    let err = run(dir.path()).unwrap_err();
    assert!(matches!(err, LandUseError::SupplyDemandMismatch { block_group: 100, .. }));
}

#[test]
fn test_scale_factors_are_reported() {
    let dir = setup(11, HOUSEHOLDS);
    let output = run(dir.path()).unwrap();

    let bellevue = output
        .report
        .scale_factors
        .iter()
        .find(|f| f.key == GeoKey::Id(1))
        .unwrap();
    assert_eq!(bellevue.control_total, 12.0);
    assert_eq!(bellevue.current_total, 9.0);
}
