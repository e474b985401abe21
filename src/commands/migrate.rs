use std::path::Path;

use colored::Colorize;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::migrate::migrate_database;
use crate::output::{Format, print_json};
use crate::store::{CoordinationDb, schema};

pub fn run(project: &Path, format: Format) -> Result<()> {
    let config = StoreConfig::load(project)?;
    let db_path = config.db_path(project)?;
    let conn = CoordinationDb::open_raw(&db_path, &config)?;
    let report = migrate_database(&conn, schema::TABLES)?;

    match format {
        Format::Json => print_json(&report)?,
        Format::Pretty => {
            if report.is_noop() {
                println!("{} schema already up to date", " ok ".green());
                return Ok(());
            }
            for table in &report.tables_created {
                println!("{} {table}", "created".green());
            }
            for added in &report.columns_added {
                println!("{} {}.{}", "added".green(), added.table, added.column);
            }
            for table in &report.tables_recreated {
                println!("{} {table}", "recreated".yellow());
            }
        }
    }
    Ok(())
}
