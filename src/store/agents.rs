use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::store::events::EventPayload;
use crate::store::{CoordinationDb, now_ms};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agent {
    pub id: i64,
    pub project_key: String,
    pub name: String,
    pub program: String,
    pub model: String,
    pub task_description: Option<String>,
    pub registered_at: i64,
    pub last_active_at: i64,
}

const AGENT_COLUMNS: &str =
    "id, project_key, name, program, model, task_description, registered_at, last_active_at";

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        project_key: row.get(1)?,
        name: row.get(2)?,
        program: row.get(3)?,
        model: row.get(4)?,
        task_description: row.get(5)?,
        registered_at: row.get(6)?,
        last_active_at: row.get(7)?,
    })
}

impl CoordinationDb {
    /// Register (or re-register) an agent. Re-registration keeps the original
    /// `registered_at` and refreshes the descriptive fields.
    pub fn register_agent(
        &self,
        project_key: &str,
        name: &str,
        program: &str,
        model: &str,
        task_description: Option<&str>,
    ) -> Result<Agent> {
        self.record(
            project_key,
            &EventPayload::AgentRegistered {
                name: name.to_string(),
                program: program.to_string(),
                model: model.to_string(),
                task_description: task_description.map(str::to_string),
                registered_at: now_ms(),
            },
        )?;
        self.get_agent(project_key, name)
    }

    /// Heartbeat: bump `last_active_at` for a registered agent.
    pub fn touch_agent(&self, project_key: &str, name: &str) -> Result<Agent> {
        let tx = self.immediate()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM agents WHERE project_key = ?1 AND name = ?2",
                params![project_key, name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::AgentNotFound {
                project_key: project_key.to_string(),
                name: name.to_string(),
            });
        }
        crate::store::events::record_in(
            &tx,
            project_key,
            &EventPayload::AgentActive {
                name: name.to_string(),
                at: now_ms(),
            },
        )?;
        tx.commit()?;
        self.get_agent(project_key, name)
    }

    pub fn get_agent(&self, project_key: &str, name: &str) -> Result<Agent> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE project_key = ?1 AND name = ?2"
                ),
                params![project_key, name],
                row_to_agent,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::AgentNotFound {
                    project_key: project_key.to_string(),
                    name: name.to_string(),
                },
                other => StoreError::Db(other),
            })
    }

    /// All agents of a project, ordered by name.
    pub fn list_agents(&self, project_key: &str) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE project_key = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![project_key], row_to_agent)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
