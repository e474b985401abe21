use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::output::{Format, print_json};
use crate::worktree;

#[derive(Serialize)]
struct PathInfo {
    project: String,
    main_root: String,
    is_worktree: bool,
    db_path: String,
}

pub fn run(project: &Path, format: Format) -> Result<()> {
    let config = StoreConfig::load(project)?;
    let info = PathInfo {
        project: project.display().to_string(),
        main_root: worktree::main_repo_root(project)?.display().to_string(),
        is_worktree: worktree::is_worktree(project),
        db_path: config.db_path(project)?.display().to_string(),
    };

    match format {
        Format::Json => print_json(&info)?,
        Format::Pretty => {
            println!("{}", info.db_path.bold());
            println!("  root: {}", info.main_root);
            if info.is_worktree {
                println!("  resolved from worktree {}", info.project.cyan());
            }
        }
    }
    Ok(())
}
