use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::messages::Importance;
use crate::store::{CoordinationDb, now_ms, projections};

pub type EventId = i64;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Everything that can happen to the coordination state.
///
/// The serialized form (tagged by `type`) is what lands in `events.data`.
/// Payloads reference rows by ids minted before the event is written, so
/// replaying an event always targets the same projection row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentRegistered {
        name: String,
        program: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_description: Option<String>,
        registered_at: i64,
    },
    AgentActive {
        name: String,
        at: i64,
    },
    MessageSent {
        message_id: String,
        from_agent: String,
        to: Vec<String>,
        subject: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        importance: Importance,
        ack_required: bool,
        created_at: i64,
    },
    MessageRead {
        message_id: String,
        agent_name: String,
        at: i64,
    },
    MessageAcked {
        message_id: String,
        agent_name: String,
        at: i64,
    },
    FileReserved {
        reservation_id: String,
        agent_name: String,
        path_pattern: String,
        exclusive: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        created_at: i64,
        expires_at: i64,
    },
    FileReleased {
        reservation_id: String,
        agent_name: String,
        released_at: i64,
    },
    LockAcquired {
        resource: String,
        holder: String,
        seq: i64,
        acquired_at: i64,
        expires_at: i64,
    },
    LockRenewed {
        resource: String,
        holder: String,
        seq: i64,
        expires_at: i64,
    },
    LockReleased {
        resource: String,
        holder: String,
        seq: i64,
        released_at: i64,
    },
}

impl EventPayload {
    /// Value stored in `events.type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentActive { .. } => "agent_active",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageRead { .. } => "message_read",
            Self::MessageAcked { .. } => "message_acked",
            Self::FileReserved { .. } => "file_reserved",
            Self::FileReleased { .. } => "file_released",
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockRenewed { .. } => "lock_renewed",
            Self::LockReleased { .. } => "lock_released",
        }
    }
}

/// A row of the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub project_key: String,
    pub timestamp: i64,
    pub sequence: Option<i64>,
    pub data: serde_json::Value,
}

impl StoredEvent {
    /// Decode `data` into a typed payload.
    pub fn payload(&self) -> Result<EventPayload> {
        let mut data = self.data.clone();
        // Rows imported from older stores may carry the type only in the column.
        if let Some(obj) = data.as_object_mut() {
            obj.entry("type")
                .or_insert_with(|| serde_json::Value::String(self.event_type.clone()));
        }
        Ok(serde_json::from_value(data)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_key: Option<String>,
    pub types: Vec<String>,
    pub after_id: Option<EventId>,
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside an open transaction)
// ---------------------------------------------------------------------------

/// Insert one immutable event row. `sequence` is the per-project ordinal.
pub(crate) fn append_in(
    conn: &Connection,
    project_key: &str,
    payload: &EventPayload,
) -> Result<StoredEvent> {
    let data = serde_json::to_value(payload)?;
    let timestamp = now_ms();
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE project_key = ?1",
        params![project_key],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            payload.kind(),
            project_key,
            timestamp,
            sequence,
            data.to_string()
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!(id, kind = payload.kind(), project_key, "event appended");

    Ok(StoredEvent {
        id,
        event_type: payload.kind().to_string(),
        project_key: project_key.to_string(),
        timestamp,
        sequence: Some(sequence),
        data,
    })
}

/// Append and materialize in the caller's transaction.
pub(crate) fn record_in(
    conn: &Connection,
    project_key: &str,
    payload: &EventPayload,
) -> Result<StoredEvent> {
    let event = append_in(conn, project_key, payload)?;
    projections::apply(conn, &event)?;
    Ok(event)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let raw: String = row.get(5)?;
    let data = serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(StoredEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        project_key: row.get(2)?,
        timestamp: row.get(3)?,
        sequence: row.get(4)?,
        data,
    })
}

pub(crate) fn read_events_in(conn: &Connection, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref project) = filter.project_key {
        param_values.push(Box::new(project.clone()));
        conditions.push(format!("project_key = ?{}", param_values.len()));
    }
    if let Some(after) = filter.after_id {
        param_values.push(Box::new(after));
        conditions.push(format!("id > ?{}", param_values.len()));
    }
    if !filter.types.is_empty() {
        let mut placeholders = Vec::with_capacity(filter.types.len());
        for t in &filter.types {
            param_values.push(Box::new(t.clone()));
            placeholders.push(format!("?{}", param_values.len()));
        }
        conditions.push(format!("type IN ({})", placeholders.join(", ")));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let limit_clause = if let Some(lim) = filter.limit {
        param_values.push(Box::new(i64::from(lim)));
        format!(" LIMIT ?{}", param_values.len())
    } else {
        String::new()
    };

    let sql = format!(
        "SELECT id, type, project_key, timestamp, sequence, data \
         FROM events{where_clause} ORDER BY id{limit_clause}"
    );
    let params_slice: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_slice.as_slice(), row_to_event)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// CoordinationDb: event log
// ---------------------------------------------------------------------------

impl CoordinationDb {
    /// Append one event to the log without touching projections.
    pub fn append(&self, project_key: &str, payload: &EventPayload) -> Result<EventId> {
        let tx = self.immediate()?;
        let event = append_in(&tx, project_key, payload)?;
        tx.commit()?;
        Ok(event.id)
    }

    /// Apply an already-stored event to the projection tables.
    pub fn apply_to_projections(&self, event: &StoredEvent) -> Result<()> {
        projections::apply(&self.conn, event)
    }

    /// Append an event and materialize it as one unit of work: if the
    /// projection write fails the append is rolled back.
    pub fn record(&self, project_key: &str, payload: &EventPayload) -> Result<StoredEvent> {
        let tx = self.immediate()?;
        let event = record_in(&tx, project_key, payload)?;
        tx.commit()?;
        Ok(event)
    }

    /// Read events in log order.
    pub fn read_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        read_events_in(&self.conn, filter)
    }

    pub fn get_event(&self, id: EventId) -> Result<Option<StoredEvent>> {
        self.conn
            .query_row(
                "SELECT id, type, project_key, timestamp, sequence, data FROM events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Highest event id written so far (0 for an empty log).
    pub fn latest_event_id(&self) -> Result<EventId> {
        let id: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
                row.get(0)
            })?;
        Ok(id)
    }

    /// Clear every projection table and replay the whole log into it.
    /// Returns the number of events replayed.
    ///
    /// Rows no event accounts for get synthesized events first, so a
    /// rebuild never drops them.
    pub fn rebuild_projections(&self) -> Result<usize> {
        let tx = self.immediate()?;
        projections::backfill_events_in(&tx)?;
        for table in crate::store::schema::PROJECTION_TABLES {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
            tx.execute("DELETE FROM sqlite_sequence WHERE name = ?1", params![table])?;
        }

        let events = read_events_in(&tx, &EventFilter::default())?;
        for event in &events {
            projections::apply(&tx, event)?;
        }
        tx.commit()?;

        tracing::info!(events = events.len(), "projections rebuilt from event log");
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::messages::InboxQuery;

    fn agent_registered(name: &str) -> EventPayload {
        EventPayload::AgentRegistered {
            name: name.to_string(),
            program: "opencode".to_string(),
            model: "test-model".to_string(),
            task_description: None,
            registered_at: now_ms(),
        }
    }

    #[test]
    fn append_assigns_monotonic_ids_and_sequences() {
        let db = CoordinationDb::open_memory().unwrap();
        let a = db.append("proj", &agent_registered("a")).unwrap();
        let b = db.append("proj", &agent_registered("b")).unwrap();
        let c = db.append("other", &agent_registered("c")).unwrap();
        assert!(a < b && b < c);

        let events = db.read_events(&EventFilter::default()).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence, Some(1));
        assert_eq!(events[1].sequence, Some(2));
        // sequence is per project
        assert_eq!(events[2].sequence, Some(1));
    }

    #[test]
    fn append_alone_leaves_projections_untouched() {
        let db = CoordinationDb::open_memory().unwrap();
        let id = db.append("proj", &agent_registered("a")).unwrap();
        assert!(db.list_agents("proj").unwrap().is_empty());

        let event = db.get_event(id).unwrap().unwrap();
        db.apply_to_projections(&event).unwrap();
        assert_eq!(db.list_agents("proj").unwrap().len(), 1);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let db = CoordinationDb::open_memory().unwrap();
        let event = db.record("proj", &agent_registered("a")).unwrap();
        db.apply_to_projections(&event).unwrap();
        db.apply_to_projections(&event).unwrap();

        let agents = db.list_agents("proj").unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "a");
    }

    #[test]
    fn payload_round_trips_through_data_column() {
        let db = CoordinationDb::open_memory().unwrap();
        let payload = agent_registered("a");
        let event = db.record("proj", &payload).unwrap();

        let stored = db.get_event(event.id).unwrap().unwrap();
        assert_eq!(stored.event_type, "agent_registered");
        assert_eq!(stored.payload().unwrap(), payload);
    }

    #[test]
    fn payload_falls_back_to_type_column() {
        let event = StoredEvent {
            id: 1,
            event_type: "agent_active".into(),
            project_key: "p".into(),
            timestamp: 0,
            sequence: None,
            data: serde_json::json!({"name": "a", "at": 5}),
        };
        assert_eq!(
            event.payload().unwrap(),
            EventPayload::AgentActive {
                name: "a".into(),
                at: 5
            }
        );
    }

    #[test]
    fn rebuild_keeps_rows_without_events() {
        let db = CoordinationDb::open_memory().unwrap();
        db.register_agent("proj", "logged", "opencode", "m", None)
            .unwrap();
        db.conn()
            .execute_batch(
                "INSERT INTO agents (project_key, name, program, model, registered_at, last_active_at)
                 VALUES ('proj', 'legacy', 'claude', 'opus', 10, 50);
                 INSERT INTO messages (id, project_key, from_agent, subject, body, importance, ack_required, created_at)
                 VALUES ('m-1', 'proj', 'legacy', 'hi', 'body', 'high', 1, 20);
                 INSERT INTO message_recipients (message_id, agent_name, read_at, acked_at)
                 VALUES ('m-1', 'logged', 30, 40);
                 INSERT INTO reservations (id, project_key, agent_name, path_pattern, exclusive, created_at, expires_at, released_at)
                 VALUES ('r-1', 'proj', 'legacy', 'src', 0, 20, 9999999999999, NULL),
                        ('r-2', 'proj', 'legacy', 'docs', 1, 20, 9999999999999, 25);
                 INSERT INTO locks (resource, holder, seq, acquired_at, expires_at)
                 VALUES ('deploy', 'legacy', 7, 20, 9999999999999);",
            )
            .unwrap();

        let agents = db.list_agents("proj").unwrap();
        let all = InboxQuery {
            include_acked: true,
            ..Default::default()
        };
        let inbox = db.inbox("proj", "logged", &all).unwrap();
        let active = db.active_reservations("proj").unwrap();
        let released = db.get_reservation("r-2").unwrap();
        let locks = db.list_locks().unwrap();

        db.rebuild_projections().unwrap();

        assert_eq!(db.list_agents("proj").unwrap(), agents);
        assert_eq!(db.inbox("proj", "logged", &all).unwrap(), inbox);
        assert_eq!(db.active_reservations("proj").unwrap(), active);
        assert_eq!(db.get_reservation("r-2").unwrap(), released);
        assert_eq!(db.list_locks().unwrap(), locks);

        // The synthesized events make the next rebuild a plain replay.
        let events = db.latest_event_id().unwrap();
        db.rebuild_projections().unwrap();
        assert_eq!(db.latest_event_id().unwrap(), events);
        assert_eq!(db.list_agents("proj").unwrap(), agents);
    }

    #[test]
    fn corrupt_event_data_is_an_error() {
        let db = CoordinationDb::open_memory().unwrap();
        db.record("proj", &agent_registered("a")).unwrap();
        db.conn()
            .execute(
                "INSERT INTO events (type, project_key, timestamp, data)
                 VALUES ('agent_active', 'proj', 1, '{not json')",
                [],
            )
            .unwrap();

        let err = db.read_events(&EventFilter::default()).unwrap_err();
        assert_eq!(err.code(), "db_error");
        let err = db.rebuild_projections().unwrap_err();
        assert_eq!(err.code(), "db_error");
        // The failed rebuild rolled back; the projection is intact.
        assert_eq!(db.list_agents("proj").unwrap().len(), 1);
    }

    #[test]
    fn read_events_filters() {
        let db = CoordinationDb::open_memory().unwrap();
        db.record("p1", &agent_registered("a")).unwrap();
        let second = db
            .record(
                "p1",
                &EventPayload::AgentActive {
                    name: "a".into(),
                    at: now_ms(),
                },
            )
            .unwrap();
        db.record("p2", &agent_registered("b")).unwrap();

        let by_project = db
            .read_events(&EventFilter {
                project_key: Some("p1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_project.len(), 2);

        let by_type = db
            .read_events(&EventFilter {
                types: vec!["agent_active".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, second.id);

        let after = db
            .read_events(&EventFilter {
                after_id: Some(second.id),
                limit: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].project_key, "p2");
        assert_eq!(db.latest_event_id().unwrap(), after[0].id);
    }

    #[test]
    fn rebuild_reproduces_projections() {
        let db = CoordinationDb::open_memory().unwrap();
        db.register_agent("proj", "alice", "opencode", "m", None)
            .unwrap();
        db.register_agent("proj", "bob", "opencode", "m", Some("tests"))
            .unwrap();
        let msg = db
            .send_message(
                "proj",
                "alice",
                &["bob"],
                "hello",
                "body",
                &Default::default(),
            )
            .unwrap();
        db.acknowledge(&msg.id, "bob").unwrap();

        let before_agents = db.list_agents("proj").unwrap();
        let all = InboxQuery {
            include_acked: true,
            ..Default::default()
        };
        let before_inbox = db.inbox("proj", "bob", &all).unwrap();
        assert_eq!(before_inbox.len(), 1);

        let replayed = db.rebuild_projections().unwrap();
        assert_eq!(replayed, 4);
        assert_eq!(db.list_agents("proj").unwrap(), before_agents);
        assert_eq!(db.inbox("proj", "bob", &all).unwrap(), before_inbox);
    }
}
