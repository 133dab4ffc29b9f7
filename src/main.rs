extern crate district_supply;

use clap::Parser;
use district_supply::input::{Config, FileLocator};
use district_supply::output::FileOutput;
use district_supply::run_district;
use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct DistrictArgs {
    /// Scenario directory holding the assembly, technology, demand and
    /// network tables
    scenario_dir: String,
    /// JSON configuration file driving the run
    config_file: String,
    #[arg(long, short, help = "Directory the result tables are written into")]
    output_dir: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = DistrictArgs::parse();

    // set up basic tracing
    let tracing_subscriber = tracing_subscriber::fmt::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(tracing_subscriber)
        .expect("setting tracing subscriber failed");

    let config = Config::from_json(BufReader::new(File::open(&args.config_file)?))?;

    let output_dir = PathBuf::from(match args.output_dir {
        Some(dir) => dir,
        None => format!("{}__results", args.scenario_dir.trim_end_matches('/')),
    });
    fs::create_dir_all(&output_dir)?;

    let locator = FileLocator::new(&args.scenario_dir);
    let results = run_district(
        &locator,
        &config,
        FileOutput::new(output_dir.clone(), "{}.csv".to_string()),
    )?;

    println!(
        "Calculated {} building(s) and {} network system(s); results written to {}",
        results.buildings.len(),
        results.networks.len(),
        output_dir.display()
    );

    Ok(())
}
