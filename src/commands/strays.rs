use std::path::Path;

use colored::Colorize;

use crate::config::StoreConfig;
use crate::consolidate::detect_stray_databases;
use crate::error::Result;
use crate::output::{Format, print_json};

pub fn run(project: &Path, format: Format) -> Result<()> {
    let config = StoreConfig::load(project)?;
    let global = config.db_path(project)?;
    let strays = detect_stray_databases(project, &global, &config)?;

    match format {
        Format::Json => print_json(&strays)?,
        Format::Pretty => {
            if strays.is_empty() {
                println!("No stray databases.");
            }
            for stray in &strays {
                println!(
                    "{} ({:?}, {} rows)",
                    stray.path.display().to_string().bold(),
                    stray.location,
                    stray.total_rows()
                );
                for (table, count) in stray.row_counts.iter().filter(|(_, c)| **c > 0) {
                    println!("  {table}: {count}");
                }
            }
        }
    }
    Ok(())
}
