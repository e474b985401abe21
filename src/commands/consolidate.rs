use std::io::IsTerminal;
use std::path::Path;

use colored::Colorize;

use crate::consolidate::{ConsolidateOptions, consolidate_databases};
use crate::error::Result;
use crate::output::{Format, print_json};
use crate::store::CoordinationDb;

pub fn run(project: &Path, yes: bool, format: Format) -> Result<()> {
    let global = CoordinationDb::from_project(project)?;
    let opts = ConsolidateOptions {
        yes,
        interactive: std::io::stdin().is_terminal(),
    };
    let report = consolidate_databases(project, &global, opts)?;

    match format {
        Format::Json => print_json(&report)?,
        Format::Pretty => {
            for migration in &report.migrations {
                println!(
                    "{} {} -> {} ({} rows)",
                    "migrated".green(),
                    migration.path.display(),
                    migration.migrated_to.display(),
                    migration.total_rows()
                );
            }
            for failure in &report.errors {
                println!("{} {}: {}", "failed".red().bold(), failure.path.display(), failure.reason);
            }
            if report.declined {
                println!("Consolidation declined.");
            }
            println!(
                "{} found, {} migrated, {} rows",
                report.strays_found,
                report.strays_migrated.to_string().green(),
                report.total_rows_migrated
            );
        }
    }
    global.close()
}
