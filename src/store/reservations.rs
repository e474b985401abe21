use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::events::{EventPayload, record_in};
use crate::store::paths::{normalize_pattern, patterns_overlap};
use crate::store::{CoordinationDb, duration_ms, now_ms};

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: String,
    pub project_key: String,
    pub agent_name: String,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub released_at: Option<i64>,
}

impl Reservation {
    pub fn is_active(&self, now: i64) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct ReserveOptions {
    pub exclusive: bool,
    /// `None` uses the store's configured reservation TTL.
    pub ttl: Option<Duration>,
    pub reason: Option<String>,
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self {
            exclusive: true,
            ttl: None,
            reason: None,
        }
    }
}

/// Why a reservation request was turned down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationConflict {
    pub requested: String,
    pub holder: String,
    pub held_pattern: String,
    pub held_exclusive: bool,
    pub held_until: i64,
    pub reason: Option<String>,
}

impl From<ReservationConflict> for StoreError {
    fn from(c: ReservationConflict) -> Self {
        StoreError::ReservationConflict {
            requested: c.requested,
            held_pattern: c.held_pattern,
            holder: c.holder,
            exclusive: c.held_exclusive,
        }
    }
}

/// Result of a reservation request. A conflict is an expected outcome of
/// coordination, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReserveOutcome {
    Granted(Reservation),
    Conflict(ReservationConflict),
}

impl ReserveOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// Turn a conflict into [`StoreError::ReservationConflict`].
    pub fn into_result(self) -> Result<Reservation> {
        match self {
            Self::Granted(r) => Ok(r),
            Self::Conflict(c) => Err(c.into()),
        }
    }
}

const RESERVATION_COLUMNS: &str = "id, project_key, agent_name, path_pattern, exclusive, reason, \
     created_at, expires_at, released_at";

fn row_to_reservation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: row.get(0)?,
        project_key: row.get(1)?,
        agent_name: row.get(2)?,
        path_pattern: row.get(3)?,
        exclusive: row.get(4)?,
        reason: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
        released_at: row.get(8)?,
    })
}

fn active_in(conn: &Connection, project_key: &str, now: i64) -> Result<Vec<Reservation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations
         WHERE project_key = ?1 AND released_at IS NULL AND expires_at > ?2
         ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![project_key, now], row_to_reservation)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Active reservations of other agents that block `pattern`.
///
/// Blocking means the patterns overlap and at least one side is exclusive.
fn conflicts_in(
    conn: &Connection,
    project_key: &str,
    agent: &str,
    pattern: &str,
    exclusive: bool,
    now: i64,
) -> Result<Vec<Reservation>> {
    Ok(active_in(conn, project_key, now)?
        .into_iter()
        .filter(|r| r.agent_name != agent)
        .filter(|r| r.exclusive || exclusive)
        .filter(|r| patterns_overlap(&r.path_pattern, pattern))
        .collect())
}

// ---------------------------------------------------------------------------
// CoordinationDb: reservations
// ---------------------------------------------------------------------------

impl CoordinationDb {
    /// Reserve a path pattern for an agent.
    ///
    /// Runs under one immediate transaction:
    /// 1. Conflict check against active reservations of other agents
    /// 2. Release this agent's active reservation on the same pattern (renewal)
    /// 3. Record `file_reserved`
    pub fn reserve(
        &self,
        project_key: &str,
        agent: &str,
        path_pattern: &str,
        opts: &ReserveOptions,
    ) -> Result<ReserveOutcome> {
        let pattern = normalize_pattern(path_pattern)
            .ok_or_else(|| StoreError::InvalidPattern(path_pattern.to_string()))?;

        let ttl = opts.ttl.unwrap_or_else(|| self.config().reservation_ttl());
        let tx = self.immediate()?;
        let now = now_ms();

        // 1. Conflict check
        let conflicts = conflicts_in(&tx, project_key, agent, &pattern, opts.exclusive, now)?;
        if let Some(held) = conflicts.into_iter().next() {
            tracing::debug!(
                agent,
                pattern = %pattern,
                holder = %held.agent_name,
                held = %held.path_pattern,
                "reservation conflict"
            );
            return Ok(ReserveOutcome::Conflict(ReservationConflict {
                requested: pattern,
                holder: held.agent_name,
                held_pattern: held.path_pattern,
                held_exclusive: held.exclusive,
                held_until: held.expires_at,
                reason: held.reason,
            }));
        }

        // 2. Same agent, same pattern: replace rather than stack.
        let own: Vec<String> = active_in(&tx, project_key, now)?
            .into_iter()
            .filter(|r| r.agent_name == agent && r.path_pattern == pattern)
            .map(|r| r.id)
            .collect();
        for id in own {
            record_in(
                &tx,
                project_key,
                &EventPayload::FileReleased {
                    reservation_id: id,
                    agent_name: agent.to_string(),
                    released_at: now,
                },
            )?;
        }

        // 3. Insert
        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            project_key: project_key.to_string(),
            agent_name: agent.to_string(),
            path_pattern: pattern,
            exclusive: opts.exclusive,
            reason: opts.reason.clone(),
            created_at: now,
            expires_at: now.saturating_add(duration_ms(ttl)),
            released_at: None,
        };
        record_in(
            &tx,
            project_key,
            &EventPayload::FileReserved {
                reservation_id: reservation.id.clone(),
                agent_name: reservation.agent_name.clone(),
                path_pattern: reservation.path_pattern.clone(),
                exclusive: reservation.exclusive,
                reason: reservation.reason.clone(),
                created_at: reservation.created_at,
                expires_at: reservation.expires_at,
            },
        )?;
        tx.commit()?;

        Ok(ReserveOutcome::Granted(reservation))
    }

    /// Release a reservation. Returns false when it is unknown or already
    /// released; releasing twice is harmless.
    pub fn release(&self, reservation_id: &str) -> Result<bool> {
        let tx = self.immediate()?;
        let row = tx
            .query_row(
                &format!(
                    "SELECT {RESERVATION_COLUMNS} FROM reservations
                     WHERE id = ?1 AND released_at IS NULL"
                ),
                params![reservation_id],
                row_to_reservation,
            )
            .optional()?;

        let Some(reservation) = row else {
            return Ok(false);
        };
        record_in(
            &tx,
            &reservation.project_key,
            &EventPayload::FileReleased {
                reservation_id: reservation.id,
                agent_name: reservation.agent_name,
                released_at: now_ms(),
            },
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Release every active reservation an agent holds in a project.
    pub fn release_all(&self, project_key: &str, agent: &str) -> Result<usize> {
        let tx = self.immediate()?;
        let now = now_ms();
        let held: Vec<Reservation> = active_in(&tx, project_key, now)?
            .into_iter()
            .filter(|r| r.agent_name == agent)
            .collect();
        for reservation in &held {
            record_in(
                &tx,
                project_key,
                &EventPayload::FileReleased {
                    reservation_id: reservation.id.clone(),
                    agent_name: agent.to_string(),
                    released_at: now,
                },
            )?;
        }
        tx.commit()?;
        Ok(held.len())
    }

    /// Active (unreleased, unexpired) reservations of a project.
    pub fn active_reservations(&self, project_key: &str) -> Result<Vec<Reservation>> {
        active_in(&self.conn, project_key, now_ms())
    }

    /// Active reservations held by other agents that would block `agent`
    /// from claiming `path_pattern` with the given exclusivity.
    pub fn find_conflicts(
        &self,
        project_key: &str,
        agent: &str,
        path_pattern: &str,
        exclusive: bool,
    ) -> Result<Vec<Reservation>> {
        let Some(pattern) = normalize_pattern(path_pattern) else {
            return Ok(Vec::new());
        };
        conflicts_in(&self.conn, project_key, agent, &pattern, exclusive, now_ms())
    }

    pub fn get_reservation(&self, id: &str) -> Result<Option<Reservation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], row_to_reservation)?;
        rows.next().transpose().map_err(Into::into)
    }
}
