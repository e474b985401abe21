use std::path::Path;

use rusqlite::Connection;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::migrate::validate_schema;
use crate::output::{Format, print_issues, print_json};
use crate::store::{CoordinationDb, schema};

/// Report schema drift without changing anything. A database that does not
/// exist yet is reported as missing every table.
pub fn run(project: &Path, format: Format) -> Result<()> {
    let config = StoreConfig::load(project)?;
    let db_path = config.db_path(project)?;
    let conn = if db_path.exists() {
        CoordinationDb::open_existing(&db_path)?
    } else {
        Connection::open_in_memory()?
    };
    let validation = validate_schema(&conn, schema::TABLES)?;

    match format {
        Format::Json => print_json(&validation)?,
        Format::Pretty => {
            println!("{}", db_path.display());
            print_issues(&validation.issues);
        }
    }
    Ok(())
}
