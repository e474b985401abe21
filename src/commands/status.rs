use std::path::Path;

use colored::Colorize;
use serde_json::json;

use crate::error::Result;
use crate::output::{Format, format_ms, print_json, truncate};
use crate::store::CoordinationDb;

/// Agents, active reservations and locks of one project.
pub fn run(project: &Path, project_key: &str, format: Format) -> Result<()> {
    let db = CoordinationDb::from_project(project)?;
    let agents = db.list_agents(project_key)?;
    let reservations = db.active_reservations(project_key)?;
    let locks = db.list_locks()?;

    match format {
        Format::Json => print_json(&json!({
            "project_key": project_key,
            "agents": agents,
            "reservations": reservations,
            "locks": locks,
        }))?,
        Format::Pretty => {
            println!("{}", "Agents".bold());
            for agent in &agents {
                println!(
                    "  {} {} / {} (active {})",
                    agent.name.cyan().bold(),
                    agent.program,
                    agent.model,
                    format_ms(agent.last_active_at)
                );
            }
            println!("{}", "Reservations".bold());
            for res in &reservations {
                let mode = if res.exclusive { "exclusive" } else { "shared" };
                println!(
                    "  {:32} {} [{mode}] until {}",
                    truncate(&res.path_pattern, 32),
                    res.agent_name.cyan(),
                    format_ms(res.expires_at)
                );
            }
            println!("{}", "Locks".bold());
            for lock in &locks {
                println!(
                    "  {} held by {} (seq {}, until {})",
                    lock.resource,
                    lock.holder.cyan(),
                    lock.seq,
                    format_ms(lock.expires_at)
                );
            }
        }
    }
    db.close()
}
