//! Schema validation and in-place migration of the coordination tables.
//!
//! Additive fixes (missing tables, missing columns) are always applied.
//! Fixes that need the table rebuilt are only applied to empty tables; a
//! table holding rows is refused and left exactly as it was.

use std::fmt;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::store::schema::{self, Affinity, ColumnSpec, TableSpec};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaIssue {
    MissingTable {
        table: String,
    },
    MissingColumn {
        table: String,
        column: String,
        expected_type: String,
    },
    WrongColumnType {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
}

impl SchemaIssue {
    pub fn table(&self) -> &str {
        match self {
            Self::MissingTable { table }
            | Self::MissingColumn { table, .. }
            | Self::WrongColumnType { table, .. } => table,
        }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTable { table } => write!(f, "{table}: table missing"),
            Self::MissingColumn {
                table,
                column,
                expected_type,
            } => write!(f, "{table}.{column}: missing ({expected_type})"),
            Self::WrongColumnType {
                table,
                column,
                expected,
                actual,
            } => write!(f, "{table}.{column}: expected {expected}, found {actual}"),
        }
    }
}

impl From<&SchemaIssue> for StoreError {
    fn from(issue: &SchemaIssue) -> Self {
        StoreError::SchemaMismatch {
            table: issue.table().to_string(),
            detail: issue.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaValidation {
    pub valid: bool,
    pub issues: Vec<SchemaIssue>,
}

impl SchemaValidation {
    /// First issue as a [`StoreError::SchemaMismatch`], for callers that
    /// treat any drift as fatal.
    pub fn into_result(self) -> Result<()> {
        match self.issues.first() {
            Some(issue) => Err(issue.into()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct ActualColumn {
    name: String,
    sql_type: String,
}

fn actual_columns(conn: &Connection, table: &str) -> Result<Vec<ActualColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ActualColumn {
            name: row.get(1)?,
            sql_type: row.get(2)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

fn table_issues(conn: &Connection, spec: &TableSpec) -> Result<Vec<SchemaIssue>> {
    if !schema::table_exists(conn, spec.name)? {
        return Ok(vec![SchemaIssue::MissingTable {
            table: spec.name.to_string(),
        }]);
    }

    let actual = actual_columns(conn, spec.name)?;
    let mut issues = Vec::new();
    for expected in spec.columns {
        match actual
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(expected.name))
        {
            None => issues.push(SchemaIssue::MissingColumn {
                table: spec.name.to_string(),
                column: expected.name.to_string(),
                expected_type: expected.sql_type.to_string(),
            }),
            Some(found) if Affinity::of(&found.sql_type) != Affinity::of(expected.sql_type) => {
                issues.push(SchemaIssue::WrongColumnType {
                    table: spec.name.to_string(),
                    column: expected.name.to_string(),
                    expected: expected.sql_type.to_string(),
                    actual: found.sql_type.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(issues)
}

/// Diff the live database against the expected table definitions.
/// Extra tables and extra columns are not issues.
pub fn validate_schema(conn: &Connection, tables: &[TableSpec]) -> Result<SchemaValidation> {
    let mut issues = Vec::new();
    for spec in tables {
        issues.extend(table_issues(conn, spec)?);
    }
    Ok(SchemaValidation {
        valid: issues.is_empty(),
        issues,
    })
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedColumn {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refusal {
    pub table: String,
    pub row_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub tables_created: Vec<String>,
    pub columns_added: Vec<AddedColumn>,
    pub tables_recreated: Vec<String>,
    pub refused: Vec<Refusal>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.tables_created.is_empty()
            && self.columns_added.is_empty()
            && self.tables_recreated.is_empty()
            && self.refused.is_empty()
    }
}

enum TablePlan {
    Create,
    AddColumns(Vec<&'static ColumnSpec>),
    Recreate,
    Ensure,
}

fn plan_for(spec: &'static TableSpec, issues: &[SchemaIssue]) -> TablePlan {
    let mut missing = Vec::new();
    for issue in issues {
        match issue {
            SchemaIssue::MissingTable { .. } => return TablePlan::Create,
            SchemaIssue::WrongColumnType { .. } => return TablePlan::Recreate,
            SchemaIssue::MissingColumn { column, .. } => match spec.column(column) {
                // A key column cannot be added after the fact.
                Some(col) if col.is_primary_key() => return TablePlan::Recreate,
                Some(col) => missing.push(col),
                None => {}
            },
        }
    }
    if missing.is_empty() {
        TablePlan::Ensure
    } else {
        TablePlan::AddColumns(missing)
    }
}

fn row_count(conn: &Connection, table: &str) -> Result<i64> {
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Build declared indexes on tables that already exist. Turned off for
    /// databases that are only read from afterwards, where a unique index
    /// would reject legacy rows repeating a natural key.
    pub index_existing_tables: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            index_existing_tables: true,
        }
    }
}

/// Bring every table in `tables` to its expected shape.
///
/// Each table is handled in its own transaction. When a table has to be
/// rebuilt but holds rows it is skipped untouched and recorded as refused;
/// the remaining tables are still migrated and the first refusal is then
/// returned as [`StoreError::DataLossRefusal`].
pub fn migrate_database(
    conn: &Connection,
    tables: &'static [TableSpec],
) -> Result<MigrationReport> {
    migrate_database_with(conn, tables, MigrateOptions::default())
}

pub fn migrate_database_with(
    conn: &Connection,
    tables: &'static [TableSpec],
    opts: MigrateOptions,
) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    for spec in tables {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let issues = table_issues(&tx, spec)?;

        match plan_for(spec, &issues) {
            TablePlan::Create => {
                schema::create_tables(&tx, std::slice::from_ref(spec))?;
                tracing::info!(table = spec.name, "created missing table");
                report.tables_created.push(spec.name.to_string());
            }
            TablePlan::AddColumns(columns) => {
                for col in columns {
                    tx.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        spec.name,
                        col.add_column_definition()
                    ))?;
                    tracing::info!(table = spec.name, column = col.name, "added missing column");
                    report.columns_added.push(AddedColumn {
                        table: spec.name.to_string(),
                        column: col.name.to_string(),
                    });
                }
                if opts.index_existing_tables {
                    schema::create_indexes(&tx, spec)?;
                }
            }
            TablePlan::Recreate => {
                let rows = row_count(&tx, spec.name)?;
                if rows > 0 {
                    tracing::warn!(
                        table = spec.name,
                        rows,
                        "schema drift needs table rebuild; refusing to drop rows"
                    );
                    report.refused.push(Refusal {
                        table: spec.name.to_string(),
                        row_count: rows,
                    });
                    // Dropping the transaction rolls back; nothing was written.
                    continue;
                }
                tx.execute_batch(&format!("DROP TABLE {}", spec.name))?;
                schema::create_tables(&tx, std::slice::from_ref(spec))?;
                tracing::info!(table = spec.name, "recreated empty table");
                report.tables_recreated.push(spec.name.to_string());
            }
            TablePlan::Ensure if opts.index_existing_tables => {
                schema::create_indexes(&tx, spec)?
            }
            TablePlan::Ensure => {}
        }
        tx.commit()?;
    }

    if let Some(first) = report.refused.first() {
        return Err(StoreError::DataLossRefusal {
            table: first.table.clone(),
            row_count: first.row_count,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;
    use crate::store::schema::TABLES;

    fn legacy_agents(conn: &Connection) {
        // No `model`/`task_description` columns and no constraints.
        conn.execute_batch(
            "CREATE TABLE agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_key TEXT NOT NULL,
                name TEXT NOT NULL,
                program TEXT NOT NULL,
                registered_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL
            );
            INSERT INTO agents (project_key, name, program, registered_at, last_active_at)
            VALUES ('proj', 'a', 'opencode', 1, 2), ('proj', 'b', 'claude', 3, 4);",
        )
        .unwrap();
    }

    #[test]
    fn fresh_database_reports_missing_tables() {
        let conn = Connection::open_in_memory().unwrap();
        let validation = validate_schema(&conn, TABLES).unwrap();
        assert!(!validation.valid);
        assert_eq!(validation.issues.len(), TABLES.len());

        let report = migrate_database(&conn, TABLES).unwrap();
        assert_eq!(report.tables_created.len(), TABLES.len());
        assert!(validate_schema(&conn, TABLES).unwrap().valid);

        // Second run is a no-op.
        assert!(migrate_database(&conn, TABLES).unwrap().is_noop());
    }

    #[test]
    fn validation_reports_missing_and_mistyped_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE locks (resource TEXT PRIMARY KEY, holder TEXT NOT NULL,
                                 acquired_at TEXT NOT NULL, expires_at INTEGER NOT NULL)",
        )
        .unwrap();
        let locks = schema::table("locks").unwrap();
        let validation = validate_schema(&conn, std::slice::from_ref(locks)).unwrap();

        assert!(!validation.valid);
        assert!(validation.issues.contains(&SchemaIssue::MissingColumn {
            table: "locks".into(),
            column: "seq".into(),
            expected_type: "INTEGER".into(),
        }));
        assert!(validation.issues.contains(&SchemaIssue::WrongColumnType {
            table: "locks".into(),
            column: "acquired_at".into(),
            expected: "INTEGER".into(),
            actual: "TEXT".into(),
        }));
        assert_eq!(
            validation.into_result().unwrap_err().code(),
            "schema_mismatch"
        );
    }

    #[test]
    fn affinity_equivalent_types_are_valid() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cursors (id BIGINT PRIMARY KEY, stream VARCHAR(64) NOT NULL,
                                   checkpoint TEXT NOT NULL, position INT NOT NULL,
                                   updated_at INTEGER NOT NULL)",
        )
        .unwrap();
        let cursors = schema::table("cursors").unwrap();
        assert!(validate_schema(&conn, std::slice::from_ref(cursors)).unwrap().valid);
    }

    #[test]
    fn missing_column_is_added_and_rows_are_kept() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_agents(&conn);
        let before: Vec<(i64, String, String, i64)> = conn
            .prepare("SELECT id, name, program, registered_at FROM agents ORDER BY id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        let report = migrate_database(&conn, TABLES).unwrap();
        assert_eq!(
            report.columns_added,
            vec![
                AddedColumn {
                    table: "agents".into(),
                    column: "model".into()
                },
                AddedColumn {
                    table: "agents".into(),
                    column: "task_description".into()
                },
            ]
        );

        let after: Vec<(i64, String, String, i64)> = conn
            .prepare("SELECT id, name, program, registered_at FROM agents ORDER BY id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(before, after);

        let model: String = conn
            .query_row("SELECT model FROM agents WHERE name = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(model, "unknown");
        assert!(validate_schema(&conn, TABLES).unwrap().valid);
    }

    #[test]
    fn wrong_type_with_rows_is_refused_and_untouched() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE locks (resource TEXT PRIMARY KEY, holder TEXT NOT NULL,
                                 acquired_at TEXT NOT NULL, expires_at INTEGER NOT NULL);
             INSERT INTO locks VALUES ('build', 'a', 'yesterday', 10);",
        )
        .unwrap();
        let sql_before: String = conn
            .query_row("SELECT sql FROM sqlite_master WHERE name = 'locks'", [], |r| {
                r.get(0)
            })
            .unwrap();

        let err = migrate_database(&conn, TABLES).unwrap_err();
        match err {
            StoreError::DataLossRefusal { ref table, row_count } => {
                assert_eq!(table, "locks");
                assert_eq!(row_count, 1);
            }
            other => panic!("expected refusal, got {other:?}"),
        }

        // Definition and data unchanged; `seq` was not added either.
        let sql_after: String = conn
            .query_row("SELECT sql FROM sqlite_master WHERE name = 'locks'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(sql_before, sql_after);
        let acquired: String = conn
            .query_row("SELECT acquired_at FROM locks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(acquired, "yesterday");

        // Every other table was still brought up to date.
        let remaining = validate_schema(&conn, TABLES).unwrap();
        assert!(remaining.issues.iter().all(|i| i.table() == "locks"));
    }

    #[test]
    fn wrong_type_on_empty_table_is_recreated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE reservations (id INTEGER PRIMARY KEY, project_key TEXT NOT NULL)",
        )
        .unwrap();

        let report = migrate_database(&conn, TABLES).unwrap();
        assert_eq!(report.tables_recreated, vec!["reservations".to_string()]);
        assert!(validate_schema(&conn, TABLES).unwrap().valid);

        conn.execute(
            "INSERT INTO reservations (id, project_key, agent_name, path_pattern, created_at, expires_at)
             VALUES (?1, 'p', 'a', 'src', 1, 2)",
            params!["res-1"],
        )
        .unwrap();
    }

    #[test]
    fn repeated_identity_blocks_index_unless_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_agents(&conn);
        conn.execute(
            "INSERT INTO agents (project_key, name, program, registered_at, last_active_at)
             VALUES ('proj', 'a', 'opencode', 5, 6)",
            [],
        )
        .unwrap();

        assert_eq!(migrate_database(&conn, TABLES).unwrap_err().code(), "db_error");

        let report = migrate_database_with(
            &conn,
            TABLES,
            MigrateOptions {
                index_existing_tables: false,
            },
        )
        .unwrap();
        assert_eq!(report.columns_added.len(), 2);
        assert_eq!(row_count(&conn, "agents").unwrap(), 3);
    }

    #[test]
    fn refusal_does_not_block_other_tables() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_agents(&conn);
        conn.execute_batch(
            "CREATE TABLE cursors (id INTEGER PRIMARY KEY, stream TEXT NOT NULL,
                                   checkpoint TEXT NOT NULL, position TEXT NOT NULL,
                                   updated_at INTEGER NOT NULL);
             INSERT INTO cursors (stream, checkpoint, position, updated_at)
             VALUES ('events', 'indexer', 'abc', 1);",
        )
        .unwrap();

        let err = migrate_database(&conn, TABLES).unwrap_err();
        assert_eq!(err.code(), "data_loss_refusal");

        // agents still got its columns.
        let agents = schema::table("agents").unwrap();
        assert!(validate_schema(&conn, std::slice::from_ref(agents)).unwrap().valid);
    }
}
