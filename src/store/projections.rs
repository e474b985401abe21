//! Materialization of events into the projection tables.
//!
//! Every write is an upsert or a guarded update keyed on the row's natural
//! key, so applying the same event any number of times converges on the same
//! row. Nothing here reads the clock.

use rusqlite::{Connection, params};

use crate::error::Result;
use crate::store::events::{EventPayload, StoredEvent};

pub(crate) fn apply(conn: &Connection, event: &StoredEvent) -> Result<()> {
    let payload = match event.payload() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(
                id = event.id,
                kind = %event.event_type,
                error = %err,
                "skipping event with unrecognised payload"
            );
            return Ok(());
        }
    };
    let project = event.project_key.as_str();

    match payload {
        EventPayload::AgentRegistered {
            name,
            program,
            model,
            task_description,
            registered_at,
        } => {
            conn.execute(
                "INSERT INTO agents (project_key, name, program, model, task_description, registered_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(project_key, name) DO UPDATE SET
                    program = excluded.program,
                    model = excluded.model,
                    task_description = excluded.task_description,
                    last_active_at = MAX(agents.last_active_at, excluded.last_active_at)",
                params![project, name, program, model, task_description, registered_at],
            )?;
        }
        EventPayload::AgentActive { name, at } => {
            conn.execute(
                "UPDATE agents SET last_active_at = MAX(last_active_at, ?3)
                 WHERE project_key = ?1 AND name = ?2",
                params![project, name, at],
            )?;
        }
        EventPayload::MessageSent {
            message_id,
            from_agent,
            to,
            subject,
            body,
            thread_id,
            reply_to,
            importance,
            ack_required,
            created_at,
        } => {
            conn.execute(
                "INSERT INTO messages (id, project_key, from_agent, subject, body, thread_id, reply_to, importance, ack_required, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    message_id,
                    project,
                    from_agent,
                    subject,
                    body,
                    thread_id,
                    reply_to,
                    importance.as_str(),
                    ack_required,
                    created_at
                ],
            )?;
            for recipient in &to {
                conn.execute(
                    "INSERT OR IGNORE INTO message_recipients (message_id, agent_name) VALUES (?1, ?2)",
                    params![message_id, recipient],
                )?;
            }
        }
        EventPayload::MessageRead {
            message_id,
            agent_name,
            at,
        } => {
            conn.execute(
                "UPDATE message_recipients SET read_at = COALESCE(read_at, ?3)
                 WHERE message_id = ?1 AND agent_name = ?2",
                params![message_id, agent_name, at],
            )?;
        }
        EventPayload::MessageAcked {
            message_id,
            agent_name,
            at,
        } => {
            conn.execute(
                "UPDATE message_recipients
                 SET acked_at = COALESCE(acked_at, ?3), read_at = COALESCE(read_at, ?3)
                 WHERE message_id = ?1 AND agent_name = ?2",
                params![message_id, agent_name, at],
            )?;
        }
        EventPayload::FileReserved {
            reservation_id,
            agent_name,
            path_pattern,
            exclusive,
            reason,
            created_at,
            expires_at,
        } => {
            conn.execute(
                "INSERT INTO reservations (id, project_key, agent_name, path_pattern, exclusive, reason, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    reservation_id,
                    project,
                    agent_name,
                    path_pattern,
                    exclusive,
                    reason,
                    created_at,
                    expires_at
                ],
            )?;
        }
        EventPayload::FileReleased {
            reservation_id,
            released_at,
            ..
        } => {
            conn.execute(
                "UPDATE reservations SET released_at = COALESCE(released_at, ?2) WHERE id = ?1",
                params![reservation_id, released_at],
            )?;
        }
        EventPayload::LockAcquired {
            resource,
            holder,
            seq,
            acquired_at,
            expires_at,
        } => {
            // A replayed older acquisition never rolls the fencing token back.
            conn.execute(
                "INSERT INTO locks (resource, holder, seq, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(resource) DO UPDATE SET
                    holder = excluded.holder,
                    seq = excluded.seq,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE excluded.seq >= locks.seq",
                params![resource, holder, seq, acquired_at, expires_at],
            )?;
        }
        EventPayload::LockRenewed {
            resource,
            holder,
            seq,
            expires_at,
        } => {
            conn.execute(
                "UPDATE locks SET expires_at = ?4 WHERE resource = ?1 AND holder = ?2 AND seq = ?3",
                params![resource, holder, seq, expires_at],
            )?;
        }
        EventPayload::LockReleased {
            resource,
            holder,
            seq,
            released_at,
        } => {
            conn.execute(
                "UPDATE locks SET expires_at = MIN(expires_at, ?4)
                 WHERE resource = ?1 AND holder = ?2 AND seq = ?3",
                params![resource, holder, seq, released_at],
            )?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Backfill: events for projection rows the log cannot reproduce
// ---------------------------------------------------------------------------

/// `json_extract` that tolerates rows whose `data` is not JSON.
macro_rules! field {
    ($alias:literal, $path:literal) => {
        concat!(
            "CASE WHEN json_valid(", $alias, ".data) THEN json_extract(", $alias,
            ".data, '$.", $path, "') END"
        )
    };
}

/// One statement per event kind, in replay order: a creating event is
/// always inserted before the events that update the row it creates.
/// Follow-up events only count when they come after the creating event,
/// otherwise a replay would apply them to a row that does not exist yet.
const BACKFILL_STATEMENTS: &[&str] = &[
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'agent_registered', a.project_key, a.registered_at, NULL,
                json_object('type', 'agent_registered', 'name', a.name, 'program', a.program,
                            'model', a.model, 'task_description', a.task_description,
                            'registered_at', a.registered_at)
         FROM agents a
         WHERE NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type = 'agent_registered' AND e.project_key = a.project_key
               AND ", field!("e", "name"), " = a.name)
         ORDER BY a.registered_at, a.id"
    ),
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'agent_active', a.project_key, a.last_active_at, NULL,
                json_object('type', 'agent_active', 'name', a.name, 'at', a.last_active_at)
         FROM agents a
         WHERE a.last_active_at > a.registered_at AND NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type IN ('agent_registered', 'agent_active')
               AND e.project_key = a.project_key
               AND ", field!("e", "name"), " = a.name
               AND COALESCE(", field!("e", "at"), ", ", field!("e", "registered_at"), ")
                   >= a.last_active_at)
         ORDER BY a.last_active_at, a.id"
    ),
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'message_sent', m.project_key, m.created_at, NULL,
                json_object('type', 'message_sent', 'message_id', m.id,
                            'from_agent', m.from_agent,
                            'to', json((SELECT json_group_array(r.agent_name)
                                        FROM message_recipients r WHERE r.message_id = m.id)),
                            'subject', m.subject, 'body', m.body,
                            'thread_id', m.thread_id, 'reply_to', m.reply_to,
                            'importance', CASE WHEN m.importance IN ('low', 'normal', 'high', 'urgent')
                                               THEN m.importance ELSE 'normal' END,
                            'ack_required', json(CASE WHEN m.ack_required THEN 'true' ELSE 'false' END),
                            'created_at', m.created_at)
         FROM messages m
         WHERE NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type = 'message_sent' AND ", field!("e", "message_id"), " = m.id)
         ORDER BY m.created_at, m.id"
    ),
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'message_read', m.project_key, r.read_at, NULL,
                json_object('type', 'message_read', 'message_id', r.message_id,
                            'agent_name', r.agent_name, 'at', r.read_at)
         FROM message_recipients r JOIN messages m ON m.id = r.message_id
         WHERE r.read_at IS NOT NULL AND NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type IN ('message_read', 'message_acked')
               AND ", field!("e", "message_id"), " = r.message_id
               AND ", field!("e", "agent_name"), " = r.agent_name
               AND e.id > (SELECT MAX(s.id) FROM events s
                           WHERE s.type = 'message_sent'
                             AND ", field!("s", "message_id"), " = r.message_id))
         ORDER BY r.read_at"
    ),
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'message_acked', m.project_key, r.acked_at, NULL,
                json_object('type', 'message_acked', 'message_id', r.message_id,
                            'agent_name', r.agent_name, 'at', r.acked_at)
         FROM message_recipients r JOIN messages m ON m.id = r.message_id
         WHERE r.acked_at IS NOT NULL AND NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type = 'message_acked'
               AND ", field!("e", "message_id"), " = r.message_id
               AND ", field!("e", "agent_name"), " = r.agent_name
               AND e.id > (SELECT MAX(s.id) FROM events s
                           WHERE s.type = 'message_sent'
                             AND ", field!("s", "message_id"), " = r.message_id))
         ORDER BY r.acked_at"
    ),
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'file_reserved', v.project_key, v.created_at, NULL,
                json_object('type', 'file_reserved', 'reservation_id', v.id,
                            'agent_name', v.agent_name, 'path_pattern', v.path_pattern,
                            'exclusive', json(CASE WHEN v.exclusive THEN 'true' ELSE 'false' END),
                            'reason', v.reason, 'created_at', v.created_at,
                            'expires_at', v.expires_at)
         FROM reservations v
         WHERE NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type = 'file_reserved' AND ", field!("e", "reservation_id"), " = v.id)
         ORDER BY v.created_at, v.id"
    ),
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'file_released', v.project_key, v.released_at, NULL,
                json_object('type', 'file_released', 'reservation_id', v.id,
                            'agent_name', v.agent_name, 'released_at', v.released_at)
         FROM reservations v
         WHERE v.released_at IS NOT NULL AND NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type = 'file_released' AND ", field!("e", "reservation_id"), " = v.id
               AND e.id > (SELECT MAX(s.id) FROM events s
                           WHERE s.type = 'file_reserved'
                             AND ", field!("s", "reservation_id"), " = v.id))
         ORDER BY v.released_at"
    ),
    // Locks are not scoped to a project.
    concat!(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         SELECT 'lock_acquired', '', l.acquired_at, NULL,
                json_object('type', 'lock_acquired', 'resource', l.resource,
                            'holder', l.holder, 'seq', l.seq,
                            'acquired_at', l.acquired_at, 'expires_at', l.expires_at)
         FROM locks l
         WHERE NOT EXISTS (
             SELECT 1 FROM events e
             WHERE e.type IN ('lock_acquired', 'lock_renewed', 'lock_released')
               AND ", field!("e", "resource"), " = l.resource
               AND ", field!("e", "seq"), " = l.seq)
         ORDER BY l.acquired_at"
    ),
];

/// Append synthesized events for projection rows that no event in the log
/// produces, e.g. rows merged from a store that predates the log. After this
/// a rebuild reproduces every row. Returns the number of events appended.
pub(crate) fn backfill_events_in(conn: &Connection) -> Result<usize> {
    let mut appended = 0;
    for sql in BACKFILL_STATEMENTS {
        appended += conn.execute(sql, [])?;
    }
    if appended > 0 {
        tracing::info!(events = appended, "backfilled events for unlogged projection rows");
    }
    Ok(appended)
}
