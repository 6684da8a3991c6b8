use anyhow::{Context, Result};
use std::env;
use std::path::Path;

use landuse_rounding::{io, logging, Pipeline, PipelineConfig};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match (args.get(1).map(|s| s.as_str()), args.get(2)) {
        (Some("run"), Some(config_path)) => run(Path::new(config_path)),
        (Some("check"), Some(config_path)) => check(Path::new(config_path)),
        _ => {
            eprintln!("Usage:");
            eprintln!("   landuse-rounding run <config.json>     run the pipeline and write outputs");
            eprintln!("   landuse-rounding check <config.json>   validate a config only");
            std::process::exit(2);
        }
    }
}

fn check(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::from_file(config_path)?;
    println!("✓ Config OK: {} rules, horizon year {}", config.rules.len(), config.horizon_year);
    Ok(())
}

fn run(config_path: &Path) -> Result<()> {
    logging::init_tracing();

    println!("🧮 Land-use controlled rounding");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Load config
    println!("\n⚙️  Loading config...");
    let config = PipelineConfig::from_file(config_path)?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    println!("✓ {} rules, seed {}", config.rules.len(), config.seed);

    // 2. Load inputs
    println!("\n📂 Loading inputs...");
    let inputs = io::load_inputs(&config, base_dir)?;
    println!(
        "✓ {} parcels, {} households",
        inputs.parcels.len(),
        inputs.households.len()
    );

    // 3. Run
    println!("\n🚦 Running pipeline...");
    let output_dir = base_dir.join(&config.output_dir);
    let output = Pipeline::new(config)
        .run(&inputs)
        .context("Pipeline run failed")?;

    // 4. Write outputs
    println!("\n💾 Writing outputs...");
    io::write_outputs(&output_dir, &output)?;
    println!("✓ Outputs written to {}", output_dir.display());

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for warning in &output.report.warnings {
        println!("⚠️  {}", warning.summary());
    }
    println!("✅ Digest: {}", output.report.digest);

    Ok(())
}
