use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot resolve worktree pointer '{}': {reason}", path.display())]
    PathResolution { path: PathBuf, reason: String },

    #[error(
        "reservation conflict: '{requested}' overlaps '{held_pattern}' held by agent '{holder}'"
    )]
    ReservationConflict {
        requested: String,
        held_pattern: String,
        holder: String,
        exclusive: bool,
    },

    #[error("invalid reservation pattern '{0}': empty or outside the repository")]
    InvalidPattern(String),

    #[error("lock '{resource}' is held by '{holder}' for another {remaining_ms}ms")]
    LockContention {
        resource: String,
        holder: String,
        remaining_ms: i64,
    },

    #[error("schema mismatch in table '{table}': {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error(
        "refusing to recreate table '{table}': it holds {row_count} row(s) and recreation would drop them"
    )]
    DataLossRefusal { table: String, row_count: i64 },

    #[error("migration of '{}' failed: {reason}", path.display())]
    MigrationFailure { path: PathBuf, reason: String },

    #[error("agent '{name}' is not registered in project '{project_key}'")]
    AgentNotFound { project_key: String, name: String },

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathResolution { .. } => "path_resolution",
            Self::ReservationConflict { .. } => "reservation_conflict",
            Self::InvalidPattern(_) => "invalid_pattern",
            Self::LockContention { .. } => "lock_contention",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::DataLossRefusal { .. } => "data_loss_refusal",
            Self::MigrationFailure { .. } => "migration_failure",
            Self::AgentNotFound { .. } => "agent_not_found",
            Self::Locked(_) => "locked",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "config_error",
            Self::Db(_) => "db_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
