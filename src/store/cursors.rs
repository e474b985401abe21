use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::store::events::{EventFilter, StoredEvent, read_events_in};
use crate::store::{CoordinationDb, now_ms};

/// Event types delivered by a named stream. `agents`, `messages`,
/// `reservations` and `locks` each select one family of events; any other
/// stream name reads the whole log.
pub fn stream_event_types(stream: &str) -> &'static [&'static str] {
    match stream {
        "agents" => &["agent_registered", "agent_active"],
        "messages" => &["message_sent", "message_read", "message_acked"],
        "reservations" => &["file_reserved", "file_released"],
        "locks" => &["lock_acquired", "lock_renewed", "lock_released"],
        _ => &[],
    }
}

fn stream_filter(stream: &str, after_id: i64, limit: Option<u32>) -> EventFilter {
    EventFilter {
        types: stream_event_types(stream)
            .iter()
            .map(|t| t.to_string())
            .collect(),
        after_id: Some(after_id),
        limit,
        ..Default::default()
    }
}

/// A consumer's read position into a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub id: i64,
    pub stream: String,
    pub checkpoint: String,
    pub position: i64,
    pub updated_at: i64,
}

impl CoordinationDb {
    pub fn cursor(&self, stream: &str, checkpoint: &str) -> Result<Option<Cursor>> {
        self.conn
            .query_row(
                "SELECT id, stream, checkpoint, position, updated_at
                 FROM cursors WHERE stream = ?1 AND checkpoint = ?2",
                params![stream, checkpoint],
                |row| {
                    Ok(Cursor {
                        id: row.get(0)?,
                        stream: row.get(1)?,
                        checkpoint: row.get(2)?,
                        position: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Current position, 0 when the cursor has never been saved.
    pub fn cursor_position(&self, stream: &str, checkpoint: &str) -> Result<i64> {
        Ok(self
            .cursor(stream, checkpoint)?
            .map(|c| c.position)
            .unwrap_or(0))
    }

    pub fn save_cursor(&self, stream: &str, checkpoint: &str, position: i64) -> Result<Cursor> {
        self.conn.execute(
            "INSERT INTO cursors (stream, checkpoint, position, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(stream, checkpoint) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at",
            params![stream, checkpoint, position, now_ms()],
        )?;
        self.cursor(stream, checkpoint)?
            .ok_or(StoreError::Db(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Events after the cursor's position, without moving it.
    pub fn events_since_cursor(
        &self,
        stream: &str,
        checkpoint: &str,
        limit: Option<u32>,
    ) -> Result<Vec<StoredEvent>> {
        let position = self.cursor_position(stream, checkpoint)?;
        self.read_events(&stream_filter(stream, position, limit))
    }

    /// Read the next batch after the cursor and advance it past that batch in
    /// one transaction, so two consumers sharing a checkpoint never see the
    /// same event.
    pub fn consume_events(
        &self,
        stream: &str,
        checkpoint: &str,
        limit: u32,
    ) -> Result<Vec<StoredEvent>> {
        let tx = self.immediate()?;
        let position: i64 = tx
            .query_row(
                "SELECT position FROM cursors WHERE stream = ?1 AND checkpoint = ?2",
                params![stream, checkpoint],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let events = read_events_in(&tx, &stream_filter(stream, position, Some(limit)))?;

        if let Some(last) = events.last() {
            tx.execute(
                "INSERT INTO cursors (stream, checkpoint, position, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream, checkpoint) DO UPDATE SET
                    position = excluded.position,
                    updated_at = excluded.updated_at",
                params![stream, checkpoint, last.id, now_ms()],
            )?;
        }
        tx.commit()?;
        Ok(events)
    }
}
