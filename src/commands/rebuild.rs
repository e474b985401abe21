use std::path::Path;

use serde_json::json;

use crate::error::Result;
use crate::output::{Format, print_json};
use crate::store::CoordinationDb;

pub fn run(project: &Path, format: Format) -> Result<()> {
    let db = CoordinationDb::from_project(project)?;
    let replayed = db.rebuild_projections()?;
    match format {
        Format::Json => print_json(&json!({ "events_replayed": replayed }))?,
        Format::Pretty => eprintln!("Replayed {replayed} events into projections"),
    }
    db.close()
}
