// 📂 CSV input and output
// Boundary adapters: files in, in-memory tables out, and back again
//
//   parcels:    parcel_id,taz_id,block_group_id,jurisdiction,<counts...>
//   controls:   key,<counts...>
//   units:      key,sf_units,mf_units
//   households: household_id,expansion_factor,household_size,block_group_id[,parcel_id]

use crate::config::PipelineConfig;
use crate::geography::{GeoKey, GeographyLevel};
use crate::housing::{household_controls, DwellingUnits};
use crate::pipeline::{PipelineInputs, PipelineOutput, RuleInput};
use crate::records::{ControlTable, ControlTotal, HouseholdRecord, ParcelRecord, ParcelTable};
use crate::scaling::{LocalInput, ScaleMethod};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const PARCEL_KEYS: [&str; 4] = ["parcel_id", "taz_id", "block_group_id", "jurisdiction"];

fn header_index(headers: &csv::StringRecord, path: &Path) -> Result<HashMap<String, usize>> {
    let index: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), i))
        .collect();
    if index.is_empty() {
        return Err(anyhow!("CSV file has no header: {:?}", path));
    }
    Ok(index)
}

fn field<'r>(row: &'r csv::StringRecord, index: &HashMap<String, usize>, name: &str, path: &Path) -> Result<&'r str> {
    let i = index
        .get(name)
        .ok_or_else(|| anyhow!("Missing column '{}' in {:?}", name, path))?;
    Ok(row.get(*i).unwrap_or("").trim())
}

fn number(raw: &str, name: &str) -> Result<f64> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>()
        .with_context(|| format!("Failed to parse '{}' as a number in column {}", raw, name))
}

fn integer(raw: &str, name: &str) -> Result<i64> {
    raw.parse::<i64>()
        .with_context(|| format!("Failed to parse '{}' as an id in column {}", raw, name))
}

// ============================================================================
// READERS
// ============================================================================

/// Load a parcel file; every column past the geography becomes a count
pub fn load_parcels(path: &Path) -> Result<ParcelTable> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("Failed to open parcel file: {:?}", path))?;
    let headers = rdr.headers().context("Failed to read parcel header")?.clone();
    let index = header_index(&headers, path)?;

    let columns: Vec<String> = headers
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !PARCEL_KEYS.contains(&h.as_str()))
        .collect();

    let mut records = Vec::new();
    for result in rdr.records() {
        let row = result.context("Failed to read parcel row")?;
        let mut record = ParcelRecord::new(
            integer(field(&row, &index, "parcel_id", path)?, "parcel_id")?,
            integer(field(&row, &index, "taz_id", path)?, "taz_id")?,
            integer(field(&row, &index, "block_group_id", path)?, "block_group_id")?,
            field(&row, &index, "jurisdiction", path)?,
        );
        for column in &columns {
            record.set(column, number(field(&row, &index, column, path)?, column)?);
        }
        records.push(record);
    }

    let table = ParcelTable::new(columns, records);
    table
        .require_unique_ids()
        .with_context(|| format!("Invalid parcel file: {:?}", path))?;

    info!(path = %path.display(), parcels = table.len(), "parcels loaded");
    Ok(table)
}

/// Load group controls at `level`; the `key` column names the group
pub fn load_controls(path: &Path, level: GeographyLevel) -> Result<ControlTable> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("Failed to open control file: {:?}", path))?;
    let headers = rdr.headers().context("Failed to read control header")?.clone();
    let index = header_index(&headers, path)?;
    let columns: Vec<String> = headers
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| h != "key")
        .collect();

    let mut table = ControlTable::new(level);
    for result in rdr.records() {
        let row = result.context("Failed to read control row")?;
        let mut control = ControlTotal::new(GeoKey::parse(field(&row, &index, "key", path)?));
        for column in &columns {
            control = control.with_total(column, number(field(&row, &index, column, path)?, column)?);
        }
        table.insert(control);
    }
    Ok(table)
}

pub fn load_dwelling_units(path: &Path) -> Result<Vec<DwellingUnits>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("Failed to open unit file: {:?}", path))?;
    let headers = rdr.headers().context("Failed to read unit header")?.clone();
    let index = header_index(&headers, path)?;

    let mut units = Vec::new();
    for result in rdr.records() {
        let row = result.context("Failed to read unit row")?;
        units.push(DwellingUnits {
            key: GeoKey::parse(field(&row, &index, "key", path)?),
            sf_units: number(field(&row, &index, "sf_units", path)?, "sf_units")?,
            mf_units: number(field(&row, &index, "mf_units", path)?, "mf_units")?,
        });
    }
    Ok(units)
}

pub fn load_households(path: &Path) -> Result<Vec<HouseholdRecord>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("Failed to open household file: {:?}", path))?;

    let mut households = Vec::new();
    for result in rdr.deserialize() {
        let household: HouseholdRecord = result.context("Failed to deserialize household")?;
        households.push(household);
    }

    info!(path = %path.display(), households = households.len(), "households loaded");
    Ok(households)
}

/// Resolve `path` against the config file's directory
fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load every input a config names; relative paths are taken from `base_dir`
pub fn load_inputs(config: &PipelineConfig, base_dir: &Path) -> Result<PipelineInputs> {
    let paths = &config.inputs;
    let mut inputs = PipelineInputs {
        parcels: load_parcels(&resolve(base_dir, &paths.parcels))?,
        ..PipelineInputs::default()
    };
    if let Some(right) = &paths.right_parcels {
        inputs.right_parcels = Some(load_parcels(&resolve(base_dir, right))?);
    }
    if let Some(households) = &paths.households {
        inputs.households = load_households(&resolve(base_dir, households))?;
    }
    if let Some(left) = &paths.left_households {
        inputs.left_households = load_households(&resolve(base_dir, left))?;
    }
    if let Some(right) = &paths.right_households {
        inputs.right_households = load_households(&resolve(base_dir, right))?;
    }

    for rule in &config.rules {
        let method = rule.method()?;
        let path = resolve(base_dir, &rule.input);
        let input = match method {
            ScaleMethod::KeepAsIs => LocalInput::ParcelEstimates {
                jurisdiction: Some(rule.jurisdiction.clone()),
                table: load_parcels(&path)?,
            },
            _ if rule.dwelling_units => {
                let units = load_dwelling_units(&path)?;
                LocalInput::GroupControls(household_controls(
                    config.control_level,
                    &units,
                    &config.assumptions_for(&rule.jurisdiction),
                ))
            }
            _ => LocalInput::GroupControls(load_controls(&path, config.control_level)?),
        };
        inputs.rules.push(RuleInput {
            rule: rule.clone(),
            method,
            input,
        });
    }

    Ok(inputs)
}

// ============================================================================
// WRITERS
// ============================================================================

pub fn write_parcels(path: &Path, table: &ParcelTable) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;

    let mut header: Vec<&str> = PARCEL_KEYS.to_vec();
    header.extend(table.columns.iter().map(|c| c.as_str()));
    wtr.write_record(&header)?;

    for record in &table.records {
        let mut row = vec![
            record.parcel_id.to_string(),
            record.taz_id.to_string(),
            record.block_group_id.to_string(),
            record.jurisdiction.clone(),
        ];
        row.extend(table.columns.iter().map(|c| record.get(c).to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_households(path: &Path, households: &[HouseholdRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    for household in households {
        wtr.serialize(household)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write the three run outputs into `dir`
pub fn write_outputs(dir: &Path, output: &PipelineOutput) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory: {:?}", dir))?;

    write_parcels(&dir.join("rounded_parcels.csv"), &output.table)?;
    write_households(&dir.join("allocated_households.csv"), output.households())?;

    let report = serde_json::to_string_pretty(&output.report).context("Failed to serialize run report")?;
    fs::write(dir.join("run_report.json"), report).context("Failed to write run report")?;

    info!(dir = %dir.display(), "outputs written");
    Ok(())
}
