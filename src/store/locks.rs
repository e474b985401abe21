use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::store::events::{EventPayload, record_in};
use crate::store::{CoordinationDb, duration_ms, now_ms};

/// A row of the `locks` table. `seq` is the fencing token handed to the
/// holder on acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub resource: String,
    pub holder: String,
    pub seq: i64,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lock {
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }

    pub fn remaining_ms(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockContention {
    pub resource: String,
    pub holder: String,
    pub seq: i64,
    pub remaining_ms: i64,
}

impl From<LockContention> for StoreError {
    fn from(c: LockContention) -> Self {
        StoreError::LockContention {
            resource: c.resource,
            holder: c.holder,
            remaining_ms: c.remaining_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LockOutcome {
    Acquired(Lock),
    Contended(LockContention),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn into_result(self) -> Result<Lock> {
        match self {
            Self::Acquired(lock) => Ok(lock),
            Self::Contended(c) => Err(c.into()),
        }
    }
}

fn current_in(conn: &Connection, resource: &str) -> Result<Option<Lock>> {
    conn.query_row(
        "SELECT resource, holder, seq, acquired_at, expires_at FROM locks WHERE resource = ?1",
        params![resource],
        |row| {
            Ok(Lock {
                resource: row.get(0)?,
                holder: row.get(1)?,
                seq: row.get(2)?,
                acquired_at: row.get(3)?,
                expires_at: row.get(4)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

impl CoordinationDb {
    /// Try to take `resource` for `holder` until `ttl` elapses.
    ///
    /// Succeeds when the resource is free, the previous lease has expired, or
    /// `holder` already owns it. Every success bumps `seq`. Never waits: a
    /// live lease held by someone else is reported as
    /// [`LockOutcome::Contended`].
    pub fn acquire_lock(
        &self,
        project_key: &str,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockOutcome> {
        let tx = self.immediate()?;
        let now = now_ms();
        let existing = current_in(&tx, resource)?;

        if let Some(ref lock) = existing
            && lock.is_live(now)
            && lock.holder != holder
        {
            tracing::debug!(resource, holder, current = %lock.holder, "lock contended");
            return Ok(LockOutcome::Contended(LockContention {
                resource: resource.to_string(),
                holder: lock.holder.clone(),
                seq: lock.seq,
                remaining_ms: lock.remaining_ms(now),
            }));
        }

        let lock = Lock {
            resource: resource.to_string(),
            holder: holder.to_string(),
            seq: existing.map_or(0, |l| l.seq) + 1,
            acquired_at: now,
            expires_at: now.saturating_add(duration_ms(ttl)),
        };
        record_in(
            &tx,
            project_key,
            &EventPayload::LockAcquired {
                resource: lock.resource.clone(),
                holder: lock.holder.clone(),
                seq: lock.seq,
                acquired_at: lock.acquired_at,
                expires_at: lock.expires_at,
            },
        )?;
        tx.commit()?;

        Ok(LockOutcome::Acquired(lock))
    }

    /// [`acquire_lock`](Self::acquire_lock) with the configured lock TTL.
    pub fn acquire_lock_default_ttl(
        &self,
        project_key: &str,
        resource: &str,
        holder: &str,
    ) -> Result<LockOutcome> {
        self.acquire_lock(project_key, resource, holder, self.config().lock_ttl())
    }

    /// Release a lease identified by its fencing token.
    ///
    /// Returns false, and changes nothing, when `holder`/`seq` no longer match
    /// the current row or the lease has already lapsed.
    pub fn release_lock(
        &self,
        project_key: &str,
        resource: &str,
        holder: &str,
        seq: i64,
    ) -> Result<bool> {
        let tx = self.immediate()?;
        let now = now_ms();
        let owned = current_in(&tx, resource)?
            .filter(|l| l.holder == holder && l.seq == seq && l.is_live(now));
        if owned.is_none() {
            tracing::debug!(resource, holder, seq, "stale lock release ignored");
            return Ok(false);
        }

        record_in(
            &tx,
            project_key,
            &EventPayload::LockReleased {
                resource: resource.to_string(),
                holder: holder.to_string(),
                seq,
                released_at: now,
            },
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Extend a lease without changing its fencing token.
    ///
    /// Allowed while `holder`/`seq` still match the row, even if the lease
    /// lapsed and nobody took the resource in the meantime.
    pub fn renew_lock(
        &self,
        project_key: &str,
        resource: &str,
        holder: &str,
        seq: i64,
        ttl: Duration,
    ) -> Result<Option<Lock>> {
        let tx = self.immediate()?;
        let Some(mut lock) =
            current_in(&tx, resource)?.filter(|l| l.holder == holder && l.seq == seq)
        else {
            return Ok(None);
        };

        lock.expires_at = now_ms().saturating_add(duration_ms(ttl));
        record_in(
            &tx,
            project_key,
            &EventPayload::LockRenewed {
                resource: lock.resource.clone(),
                holder: lock.holder.clone(),
                seq: lock.seq,
                expires_at: lock.expires_at,
            },
        )?;
        tx.commit()?;
        Ok(Some(lock))
    }

    /// The live lease on `resource`, if any.
    pub fn current_lock(&self, resource: &str) -> Result<Option<Lock>> {
        let now = now_ms();
        Ok(current_in(&self.conn, resource)?.filter(|l| l.is_live(now)))
    }

    /// Every lock row, expired ones included, ordered by resource.
    pub fn list_locks(&self) -> Result<Vec<Lock>> {
        let mut stmt = self.conn.prepare(
            "SELECT resource, holder, seq, acquired_at, expires_at FROM locks ORDER BY resource",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Lock {
                resource: row.get(0)?,
                holder: row.get(1)?,
                seq: row.get(2)?,
                acquired_at: row.get(3)?,
                expires_at: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
