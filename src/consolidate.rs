//! Discovery and merging of stray coordination databases.
//!
//! Pipeline: detect → analyze → migrate each stray into the global store →
//! report. Each stray is migrated on its own; a broken one is recorded in the
//! report and the rest still go through.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::filelock::MaintenanceLock;
use crate::migrate::{self, MigrateOptions};
use crate::store::{CoordinationDb, now_ms, projections, schema};
use crate::worktree::{self, STORE_DIR};

/// Suffix appended to a stray file once its rows live in the global store.
pub const MIGRATED_SUFFIX: &str = ".migrated";

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrayLocation {
    /// `.opencode/*.db` at the principal root.
    ProjectOpencode,
    /// `.hive/*.db`, the pre-`.opencode` layout.
    LegacyHive,
    /// `.opencode/` below a package or sub-directory.
    NestedPackage,
    /// `.opencode/` inside a linked worktree.
    Worktree,
    /// Matched by a configured `extra_stray_locations` pattern.
    Custom,
}

/// Relative glob patterns scanned under each base directory.
const BUILTIN_LOCATIONS: &[(&str, StrayLocation)] = &[
    (".opencode/*.db", StrayLocation::ProjectOpencode),
    (".hive/*.db", StrayLocation::LegacyHive),
    ("*/.opencode/*.db", StrayLocation::NestedPackage),
    ("packages/*/.opencode/*.db", StrayLocation::NestedPackage),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrayDatabase {
    pub path: PathBuf,
    pub location: StrayLocation,
    /// Rows per coordination table; absent tables count as 0.
    pub row_counts: BTreeMap<String, i64>,
}

impl StrayDatabase {
    pub fn total_rows(&self) -> i64 {
        self.row_counts.values().sum()
    }
}

/// Count rows per coordination table without modifying the file.
pub fn analyze_stray_database(path: &Path, location: StrayLocation) -> Result<StrayDatabase> {
    let conn = CoordinationDb::open_existing(path)?;
    let mut row_counts = BTreeMap::new();
    for spec in schema::TABLES {
        let count = if schema::table_exists(&conn, spec.name)? {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", spec.name), [], |row| {
                row.get(0)
            })?
        } else {
            0
        };
        row_counts.insert(spec.name.to_string(), count);
    }
    Ok(StrayDatabase {
        path: path.to_path_buf(),
        location,
        row_counts,
    })
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Base directories to scan: the principal root, plus the project path when
/// it is a worktree or a sub-directory.
fn scan_bases(project_path: &Path) -> Result<Vec<(PathBuf, bool)>> {
    let root = worktree::main_repo_root(project_path)?;
    let mut bases = vec![(root.clone(), true)];
    if canonical(project_path) != canonical(&root) {
        bases.push((project_path.to_path_buf(), false));
    }
    Ok(bases)
}

fn classify(builtin: StrayLocation, base: &Path, is_root: bool) -> StrayLocation {
    match builtin {
        StrayLocation::ProjectOpencode if !is_root && worktree::is_worktree(base) => {
            StrayLocation::Worktree
        }
        StrayLocation::ProjectOpencode if !is_root => StrayLocation::NestedPackage,
        other => other,
    }
}

fn glob_under(base: &Path, relative: &str) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&base.to_string_lossy()),
        relative
    );
    match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).filter(|p| p.is_file()).collect(),
        Err(err) => {
            tracing::warn!(pattern = %pattern, error = %err, "skipping invalid stray location");
            Vec::new()
        }
    }
}

/// Find database files in historical locations other than `global_path`.
///
/// Files that cannot be analyzed are still returned (with empty counts) so
/// the migration step can report why they failed.
pub fn detect_stray_databases(
    project_path: &Path,
    global_path: &Path,
    config: &StoreConfig,
) -> Result<Vec<StrayDatabase>> {
    let global = canonical(global_path);
    let mut found: BTreeMap<PathBuf, (PathBuf, StrayLocation)> = BTreeMap::new();

    for (base, is_root) in scan_bases(project_path)? {
        let custom = config
            .extra_stray_locations
            .iter()
            .map(|p| (p.as_str(), StrayLocation::Custom));
        let locations = BUILTIN_LOCATIONS.iter().copied().chain(custom);

        for (relative, kind) in locations {
            for path in glob_under(&base, relative) {
                let key = canonical(&path);
                if key == global || path.to_string_lossy().ends_with(MIGRATED_SUFFIX) {
                    continue;
                }
                found
                    .entry(key)
                    .or_insert_with(|| (path, classify(kind, &base, is_root)));
            }
        }
    }

    let mut strays = Vec::with_capacity(found.len());
    for (path, location) in found.into_values() {
        match analyze_stray_database(&path, location) {
            Ok(stray) => strays.push(stray),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot analyze stray database");
                strays.push(StrayDatabase {
                    path,
                    location,
                    row_counts: BTreeMap::new(),
                });
            }
        }
    }
    tracing::debug!(count = strays.len(), "stray databases detected");
    Ok(strays)
}

// ---------------------------------------------------------------------------
// Migration of one stray
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrayMigration {
    pub path: PathBuf,
    pub migrated_to: PathBuf,
    /// Rows actually inserted per table; colliding rows are not counted.
    pub rows_migrated: BTreeMap<String, usize>,
    /// Events synthesized for merged rows the stray had no events for.
    pub events_backfilled: usize,
}

impl StrayMigration {
    pub fn total_rows(&self) -> usize {
        self.rows_migrated.values().sum()
    }
}

/// Copy statements, run against the global connection with the stray
/// attached as `stray`. Rows colliding on their natural key are skipped.
const COPY_STATEMENTS: &[(&str, &str)] = &[
    (
        "events",
        "INSERT INTO main.events (type, project_key, timestamp, sequence, data)
         SELECT s.type, s.project_key, s.timestamp, NULL, s.data
         FROM stray.events s
         WHERE NOT EXISTS (
             SELECT 1 FROM main.events e
             WHERE e.project_key = s.project_key AND e.type = s.type
               AND e.timestamp = s.timestamp AND e.data = s.data
         )
         ORDER BY s.id",
    ),
    (
        "agents",
        "INSERT OR IGNORE INTO main.agents
             (project_key, name, program, model, task_description, registered_at, last_active_at)
         SELECT project_key, name, program, model, task_description, registered_at, last_active_at
         FROM stray.agents ORDER BY last_active_at DESC, id DESC",
    ),
    (
        "messages",
        "INSERT OR IGNORE INTO main.messages
             (id, project_key, from_agent, subject, body, thread_id, reply_to,
              importance, ack_required, created_at)
         SELECT id, project_key, from_agent, subject, body, thread_id, reply_to,
                importance, ack_required, created_at
         FROM stray.messages",
    ),
    (
        "message_recipients",
        "INSERT OR IGNORE INTO main.message_recipients (message_id, agent_name, read_at, acked_at)
         SELECT message_id, agent_name, read_at, acked_at FROM stray.message_recipients",
    ),
    (
        "reservations",
        "INSERT OR IGNORE INTO main.reservations
             (id, project_key, agent_name, path_pattern, exclusive, reason,
              created_at, expires_at, released_at)
         SELECT id, project_key, agent_name, path_pattern, exclusive, reason,
                created_at, expires_at, released_at
         FROM stray.reservations",
    ),
    (
        "locks",
        "INSERT OR IGNORE INTO main.locks (resource, holder, seq, acquired_at, expires_at)
         SELECT resource, holder, seq, acquired_at, expires_at FROM stray.locks",
    ),
    (
        "cursors",
        "INSERT OR IGNORE INTO main.cursors (stream, checkpoint, position, updated_at)
         SELECT stream, checkpoint, position, updated_at FROM stray.cursors
         ORDER BY updated_at DESC, id DESC",
    ),
];

fn failure(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::MigrationFailure {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn copy_rows(global: &CoordinationDb) -> Result<(BTreeMap<String, usize>, usize)> {
    let tx = global.immediate()?;
    let mut counts = BTreeMap::new();
    for (table, sql) in COPY_STATEMENTS {
        let inserted = tx.execute(sql, [])?;
        counts.insert((*table).to_string(), inserted);
    }
    let backfilled = projections::backfill_events_in(&tx)?;
    tx.commit()?;
    Ok((counts, backfilled))
}

/// Events whose `data` is not JSON would make the global log unreadable.
fn check_event_data(conn: &Connection) -> Result<()> {
    let unreadable: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE NOT json_valid(data)",
        [],
        |row| row.get(0),
    )?;
    if unreadable > 0 {
        return Err(StoreError::SchemaMismatch {
            table: "events".to_string(),
            detail: format!("{unreadable} event(s) carry data that is not JSON"),
        });
    }
    Ok(())
}

fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(MIGRATED_SUFFIX);
    let marker = PathBuf::from(name);
    if !marker.exists() {
        return marker;
    }
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}{MIGRATED_SUFFIX}", now_ms()));
    PathBuf::from(name)
}

/// Merge one stray into `global` and rename it to `<path>.migrated`.
///
/// The stray's schema is brought up to date first. All rows are copied in a
/// single global transaction, so a failure leaves the global store unchanged
/// and the stray in place. Every failure is reported as
/// [`StoreError::MigrationFailure`].
pub fn migrate_to_global(stray: &StrayDatabase, global: &CoordinationDb) -> Result<StrayMigration> {
    let path = stray.path.as_path();

    {
        let conn = CoordinationDb::open_existing(path).map_err(|e| failure(path, e))?;
        // Repeated natural keys in a legacy stray are resolved by the copy,
        // so its unique indexes are not built.
        let opts = MigrateOptions {
            index_existing_tables: false,
        };
        migrate::migrate_database_with(&conn, schema::TABLES, opts)
            .map_err(|e| failure(path, e))?;
        check_event_data(&conn).map_err(|e| failure(path, e))?;
        conn.close().map_err(|(_, e)| failure(path, e))?;
    }

    let conn = global.conn();
    conn.execute(
        "ATTACH DATABASE ?1 AS stray",
        params![path.to_string_lossy()],
    )
    .map_err(|e| failure(path, e))?;
    let copied = copy_rows(global);
    let detached = conn.execute_batch("DETACH DATABASE stray");
    let (rows_migrated, events_backfilled) = copied.map_err(|e| failure(path, e))?;
    detached.map_err(|e| failure(path, e))?;

    let migrated_to = marker_path(path);
    fs::rename(path, &migrated_to).map_err(|e| failure(path, e))?;

    let migration = StrayMigration {
        path: path.to_path_buf(),
        migrated_to,
        rows_migrated,
        events_backfilled,
    };
    tracing::info!(
        path = %path.display(),
        rows = migration.total_rows(),
        "migrated stray database"
    );
    Ok(migration)
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidateOptions {
    /// Skip confirmation.
    pub yes: bool,
    /// Ask before migrating; without it consolidation proceeds unattended.
    pub interactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrayFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub strays_found: usize,
    pub strays_migrated: usize,
    pub total_rows_migrated: usize,
    pub declined: bool,
    pub migrations: Vec<StrayMigration>,
    pub errors: Vec<StrayFailure>,
}

/// Detect strays around `project_path` and merge them into `global`,
/// prompting on stdin when interactive.
pub fn consolidate_databases(
    project_path: &Path,
    global: &CoordinationDb,
    opts: ConsolidateOptions,
) -> Result<ConsolidationReport> {
    consolidate_databases_with(project_path, global, opts, prompt_stdin)
}

/// Like [`consolidate_databases`] with a caller-supplied confirmation.
pub fn consolidate_databases_with<F>(
    project_path: &Path,
    global: &CoordinationDb,
    opts: ConsolidateOptions,
    confirm: F,
) -> Result<ConsolidationReport>
where
    F: FnOnce(&[StrayDatabase]) -> bool,
{
    let config = StoreConfig::load(project_path)?;
    let global_path = match global.path() {
        Some(path) => path.to_path_buf(),
        None => config.db_path(project_path)?,
    };
    let _guard = match global.path() {
        Some(path) => Some(MaintenanceLock::for_database(path)?),
        None => None,
    };

    let strays = detect_stray_databases(project_path, &global_path, &config)?;
    let mut report = ConsolidationReport {
        strays_found: strays.len(),
        ..Default::default()
    };
    if strays.is_empty() {
        return Ok(report);
    }

    if opts.interactive && !opts.yes && !confirm(&strays) {
        tracing::info!(strays = strays.len(), "consolidation declined");
        report.declined = true;
        return Ok(report);
    }

    for stray in &strays {
        match migrate_to_global(stray, global) {
            Ok(migration) => {
                report.strays_migrated += 1;
                report.total_rows_migrated += migration.total_rows();
                report.migrations.push(migration);
            }
            Err(err) => {
                tracing::warn!(path = %stray.path.display(), error = %err, "stray migration failed");
                report.errors.push(StrayFailure {
                    path: stray.path.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    tracing::info!(
        found = report.strays_found,
        migrated = report.strays_migrated,
        rows = report.total_rows_migrated,
        failed = report.errors.len(),
        "consolidation finished"
    );
    Ok(report)
}

fn prompt_stdin(strays: &[StrayDatabase]) -> bool {
    let mut stderr = io::stderr();
    let _ = writeln!(stderr, "Found {} stray database(s):", strays.len());
    for stray in strays {
        let _ = writeln!(
            stderr,
            "  {} ({:?}, {} rows)",
            stray.path.display(),
            stray.location,
            stray.total_rows()
        );
    }
    let _ = write!(stderr, "Migrate them into the {STORE_DIR} store? [y/N] ");
    let _ = stderr.flush();

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
