//! Authoritative on-disk shape of the coordination tables.
//!
//! The same definitions drive table creation, schema validation and
//! migration, so they are kept as data rather than as one DDL blob.

use rusqlite::Connection;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: &'static str,
    /// Everything after the type in the column definition.
    pub modifiers: &'static str,
}

impl ColumnSpec {
    const fn new(name: &'static str, sql_type: &'static str, modifiers: &'static str) -> Self {
        Self {
            name,
            sql_type,
            modifiers,
        }
    }

    pub fn is_primary_key(&self) -> bool {
        self.modifiers.to_ascii_uppercase().contains("PRIMARY KEY")
    }

    fn definition(&self) -> String {
        if self.modifiers.is_empty() {
            format!("{} {}", self.name, self.sql_type)
        } else {
            format!("{} {} {}", self.name, self.sql_type, self.modifiers)
        }
    }

    /// Column definition usable with `ALTER TABLE ADD COLUMN`.
    ///
    /// SQLite rejects added PRIMARY KEY/UNIQUE columns and NOT NULL columns
    /// without a default, so those get an affinity-appropriate default.
    pub fn add_column_definition(&self) -> String {
        let upper = self.modifiers.to_ascii_uppercase();
        let not_null = upper.contains("NOT NULL");
        let default = upper
            .find("DEFAULT")
            .map(|idx| self.modifiers[idx..].trim().to_string());

        let mut def = format!("{} {}", self.name, self.sql_type);
        match (not_null, default) {
            (_, Some(default)) if not_null => {
                def.push_str(" NOT NULL ");
                def.push_str(&default);
            }
            (_, Some(default)) => {
                def.push(' ');
                def.push_str(&default);
            }
            (true, None) => {
                def.push_str(" NOT NULL DEFAULT ");
                def.push_str(Affinity::of(self.sql_type).zero_literal());
            }
            (false, None) => {}
        }
        def
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    /// Table-level constraints appended after the columns.
    pub constraints: &'static [&'static str],
    pub indexes: &'static [&'static str],
}

impl TableSpec {
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnSpec::definition).collect();
        parts.extend(self.constraints.iter().map(|c| c.to_string()));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            parts.join(",\n    ")
        )
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

/// SQLite type affinity, used to compare declared column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// Affinity of a declared type, following SQLite's rules in order.
    pub fn of(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }

    fn zero_literal(self) -> &'static str {
        match self {
            Self::Text => "''",
            Self::Blob => "x''",
            Self::Integer | Self::Real | Self::Numeric => "0",
        }
    }
}

const EVENTS: TableSpec = TableSpec {
    name: "events",
    columns: &[
        ColumnSpec::new("id", "INTEGER", "PRIMARY KEY AUTOINCREMENT"),
        ColumnSpec::new("type", "TEXT", "NOT NULL"),
        ColumnSpec::new("project_key", "TEXT", "NOT NULL"),
        ColumnSpec::new("timestamp", "INTEGER", "NOT NULL"),
        ColumnSpec::new("sequence", "INTEGER", ""),
        ColumnSpec::new("data", "TEXT", "NOT NULL DEFAULT '{}'"),
    ],
    constraints: &[],
    indexes: &[
        "CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_key)",
        "CREATE INDEX IF NOT EXISTS idx_events_type ON events(type)",
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
    ],
};

const AGENTS: TableSpec = TableSpec {
    name: "agents",
    columns: &[
        ColumnSpec::new("id", "INTEGER", "PRIMARY KEY AUTOINCREMENT"),
        ColumnSpec::new("project_key", "TEXT", "NOT NULL"),
        ColumnSpec::new("name", "TEXT", "NOT NULL"),
        ColumnSpec::new("program", "TEXT", "NOT NULL DEFAULT 'opencode'"),
        ColumnSpec::new("model", "TEXT", "NOT NULL DEFAULT 'unknown'"),
        ColumnSpec::new("task_description", "TEXT", ""),
        ColumnSpec::new("registered_at", "INTEGER", "NOT NULL"),
        ColumnSpec::new("last_active_at", "INTEGER", "NOT NULL"),
    ],
    constraints: &[],
    // An index rather than a table constraint so migrated legacy tables get it too.
    indexes: &["CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_identity ON agents(project_key, name)"],
};

const MESSAGES: TableSpec = TableSpec {
    name: "messages",
    columns: &[
        ColumnSpec::new("id", "TEXT", "PRIMARY KEY"),
        ColumnSpec::new("project_key", "TEXT", "NOT NULL"),
        ColumnSpec::new("from_agent", "TEXT", "NOT NULL"),
        ColumnSpec::new("subject", "TEXT", "NOT NULL"),
        ColumnSpec::new("body", "TEXT", "NOT NULL"),
        ColumnSpec::new("thread_id", "TEXT", ""),
        ColumnSpec::new("reply_to", "TEXT", ""),
        ColumnSpec::new("importance", "TEXT", "NOT NULL DEFAULT 'normal'"),
        ColumnSpec::new("ack_required", "INTEGER", "NOT NULL DEFAULT 0"),
        ColumnSpec::new("created_at", "INTEGER", "NOT NULL"),
    ],
    constraints: &[],
    indexes: &[
        "CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_key, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages(reply_to)",
    ],
};

const MESSAGE_RECIPIENTS: TableSpec = TableSpec {
    name: "message_recipients",
    columns: &[
        ColumnSpec::new("message_id", "TEXT", "NOT NULL"),
        ColumnSpec::new("agent_name", "TEXT", "NOT NULL"),
        ColumnSpec::new("read_at", "INTEGER", ""),
        ColumnSpec::new("acked_at", "INTEGER", ""),
    ],
    constraints: &["PRIMARY KEY (message_id, agent_name)"],
    indexes: &[
        "CREATE INDEX IF NOT EXISTS idx_recipients_agent ON message_recipients(agent_name, acked_at)",
    ],
};

const RESERVATIONS: TableSpec = TableSpec {
    name: "reservations",
    columns: &[
        ColumnSpec::new("id", "TEXT", "PRIMARY KEY"),
        ColumnSpec::new("project_key", "TEXT", "NOT NULL"),
        ColumnSpec::new("agent_name", "TEXT", "NOT NULL"),
        ColumnSpec::new("path_pattern", "TEXT", "NOT NULL"),
        ColumnSpec::new("exclusive", "INTEGER", "NOT NULL DEFAULT 1"),
        ColumnSpec::new("reason", "TEXT", ""),
        ColumnSpec::new("created_at", "INTEGER", "NOT NULL"),
        ColumnSpec::new("expires_at", "INTEGER", "NOT NULL"),
        ColumnSpec::new("released_at", "INTEGER", ""),
    ],
    constraints: &[],
    indexes: &[
        "CREATE INDEX IF NOT EXISTS idx_reservations_project ON reservations(project_key)",
        "CREATE INDEX IF NOT EXISTS idx_reservations_expires ON reservations(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_reservations_active \
         ON reservations(project_key, expires_at) WHERE released_at IS NULL",
    ],
};

const LOCKS: TableSpec = TableSpec {
    name: "locks",
    columns: &[
        ColumnSpec::new("resource", "TEXT", "PRIMARY KEY"),
        ColumnSpec::new("holder", "TEXT", "NOT NULL"),
        ColumnSpec::new("seq", "INTEGER", "NOT NULL DEFAULT 0"),
        ColumnSpec::new("acquired_at", "INTEGER", "NOT NULL"),
        ColumnSpec::new("expires_at", "INTEGER", "NOT NULL"),
    ],
    constraints: &[],
    indexes: &["CREATE INDEX IF NOT EXISTS idx_locks_expires ON locks(expires_at)"],
};

const CURSORS: TableSpec = TableSpec {
    name: "cursors",
    columns: &[
        ColumnSpec::new("id", "INTEGER", "PRIMARY KEY AUTOINCREMENT"),
        ColumnSpec::new("stream", "TEXT", "NOT NULL"),
        ColumnSpec::new("checkpoint", "TEXT", "NOT NULL"),
        ColumnSpec::new("position", "INTEGER", "NOT NULL DEFAULT 0"),
        ColumnSpec::new("updated_at", "INTEGER", "NOT NULL"),
    ],
    constraints: &[],
    indexes: &["CREATE UNIQUE INDEX IF NOT EXISTS idx_cursors_identity ON cursors(stream, checkpoint)"],
};

/// Every coordination table, in creation order.
pub const TABLES: &[TableSpec] = &[
    EVENTS,
    AGENTS,
    MESSAGES,
    MESSAGE_RECIPIENTS,
    RESERVATIONS,
    LOCKS,
    CURSORS,
];

/// Projection tables derived from the event log, cleared on rebuild.
pub const PROJECTION_TABLES: &[&str] = &[
    "agents",
    "messages",
    "message_recipients",
    "reservations",
    "locks",
];

pub fn table(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|t| t.name == name)
}

/// Create every table in `tables` plus its indexes, idempotently.
pub fn create_tables(conn: &Connection, tables: &[TableSpec]) -> Result<()> {
    for spec in tables {
        conn.execute_batch(&spec.create_sql())?;
        create_indexes(conn, spec)?;
    }
    Ok(())
}

pub fn create_indexes(conn: &Connection, spec: &TableSpec) -> Result<()> {
    for index in spec.indexes {
        conn.execute_batch(index)?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
