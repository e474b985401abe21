use std::collections::{HashSet, VecDeque};

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::events::{EventPayload, record_in};
use crate::store::{CoordinationDb, now_ms};

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Lenient parse for values read back from the database.
    pub fn from_db(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub project_key: String,
    pub from_agent: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub message_id: String,
    pub agent_name: String,
    pub read_at: Option<i64>,
    pub acked_at: Option<i64>,
}

/// A message as seen by one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    #[serde(flatten)]
    pub message: Message,
    pub read_at: Option<i64>,
    pub acked_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InboxQuery {
    pub unread_only: bool,
    pub include_acked: bool,
    pub limit: Option<u32>,
}

const MESSAGE_COLUMNS: &str = "m.id, m.project_key, m.from_agent, m.subject, m.body, \
     m.thread_id, m.reply_to, m.importance, m.ack_required, m.created_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        project_key: row.get(1)?,
        from_agent: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        thread_id: row.get(5)?,
        reply_to: row.get(6)?,
        importance: Importance::from_db(&row.get::<_, String>(7)?),
        ack_required: row.get(8)?,
        created_at: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// CoordinationDb: messages
// ---------------------------------------------------------------------------

impl CoordinationDb {
    /// Send a message to one or more recipients.
    pub fn send_message(
        &self,
        project_key: &str,
        from: &str,
        to: &[&str],
        subject: &str,
        body: &str,
        opts: &SendOptions,
    ) -> Result<Message> {
        let mut recipients: Vec<String> = Vec::with_capacity(to.len());
        for name in to {
            if !recipients.iter().any(|r| r.as_str() == *name) {
                recipients.push((*name).to_string());
            }
        }

        let id = Uuid::new_v4().to_string();
        self.record(
            project_key,
            &EventPayload::MessageSent {
                message_id: id.clone(),
                from_agent: from.to_string(),
                to: recipients,
                subject: subject.to_string(),
                body: body.to_string(),
                thread_id: opts.thread_id.clone(),
                reply_to: opts.reply_to.clone(),
                importance: opts.importance,
                ack_required: opts.ack_required,
                created_at: now_ms(),
            },
        )?;

        self.get_message(&id)?
            .ok_or(StoreError::Db(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn message_recipients(&self, message_id: &str) -> Result<Vec<Recipient>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, agent_name, read_at, acked_at
             FROM message_recipients WHERE message_id = ?1 ORDER BY agent_name",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(Recipient {
                message_id: row.get(0)?,
                agent_name: row.get(1)?,
                read_at: row.get(2)?,
                acked_at: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Messages addressed to `agent`, newest first.
    pub fn inbox(&self, project_key: &str, agent: &str, query: &InboxQuery) -> Result<Vec<InboxEntry>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}, r.read_at, r.acked_at
             FROM messages m JOIN message_recipients r ON r.message_id = m.id
             WHERE m.project_key = ?1 AND r.agent_name = ?2"
        );
        if query.unread_only {
            sql.push_str(" AND r.read_at IS NULL");
        }
        if !query.include_acked {
            sql.push_str(" AND r.acked_at IS NULL");
        }
        sql.push_str(" ORDER BY m.created_at DESC, m.id");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_key, agent], |row| {
            Ok(InboxEntry {
                message: row_to_message(row)?,
                read_at: row.get(10)?,
                acked_at: row.get(11)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Mark a message read for one recipient. Returns false when the agent is
    /// not a recipient or has already read it.
    pub fn mark_read(&self, message_id: &str, agent: &str) -> Result<bool> {
        self.update_recipient(message_id, agent, false)
    }

    /// Acknowledge a message for one recipient (implies read).
    pub fn acknowledge(&self, message_id: &str, agent: &str) -> Result<bool> {
        self.update_recipient(message_id, agent, true)
    }

    fn update_recipient(&self, message_id: &str, agent: &str, ack: bool) -> Result<bool> {
        let tx = self.immediate()?;
        let state: Option<(String, Option<i64>, Option<i64>)> = tx
            .query_row(
                "SELECT m.project_key, r.read_at, r.acked_at
                 FROM message_recipients r JOIN messages m ON m.id = r.message_id
                 WHERE r.message_id = ?1 AND r.agent_name = ?2",
                params![message_id, agent],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((project_key, read_at, acked_at)) = state else {
            return Ok(false);
        };
        let already = if ack { acked_at.is_some() } else { read_at.is_some() };
        if already {
            return Ok(false);
        }

        let payload = if ack {
            EventPayload::MessageAcked {
                message_id: message_id.to_string(),
                agent_name: agent.to_string(),
                at: now_ms(),
            }
        } else {
            EventPayload::MessageRead {
                message_id: message_id.to_string(),
                agent_name: agent.to_string(),
                at: now_ms(),
            }
        };
        record_in(&tx, &project_key, &payload)?;
        tx.commit()?;
        Ok(true)
    }

    /// All messages of a thread, oldest first.
    pub fn thread_messages(&self, project_key: &str, thread_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE m.project_key = ?1 AND m.thread_id = ?2
             ORDER BY m.created_at, m.id"
        ))?;
        let rows = stmt.query_map(params![project_key, thread_id], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Breadth-first walk of the reply tree rooted at `root_id`, root first.
    ///
    /// The schema does not forbid `reply_to` cycles (imported data can carry
    /// them), so visited ids are tracked and never expanded twice.
    pub fn reply_tree(&self, root_id: &str) -> Result<Vec<Message>> {
        let Some(root) = self.get_message(root_id)? else {
            return Ok(Vec::new());
        };

        let mut children_stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.reply_to = ?1 ORDER BY m.created_at, m.id"
        ))?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Message> = VecDeque::new();
        let mut out = Vec::new();
        visited.insert(root.id.clone());
        queue.push_back(root);

        while let Some(message) = queue.pop_front() {
            let children = children_stmt
                .query_map(params![message.id], row_to_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for child in children {
                if visited.insert(child.id.clone()) {
                    queue.push_back(child);
                }
            }
            out.push(message);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_read_inbox() {
        let db = CoordinationDb::open_memory().unwrap();
        let msg = db
            .send_message(
                "proj",
                "alice",
                &["bob", "carol", "bob"],
                "status",
                "auth module done",
                &SendOptions {
                    importance: Importance::High,
                    ack_required: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(msg.importance, Importance::High);
        assert!(msg.ack_required);

        let recipients = db.message_recipients(&msg.id).unwrap();
        assert_eq!(recipients.len(), 2);

        let inbox = db.inbox("proj", "bob", &InboxQuery::default()).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message.subject, "status");
        assert!(inbox[0].read_at.is_none());

        assert!(db.inbox("proj", "alice", &InboxQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn read_and_ack_are_idempotent() {
        let db = CoordinationDb::open_memory().unwrap();
        let msg = db
            .send_message("proj", "a", &["b"], "s", "b", &SendOptions::default())
            .unwrap();

        assert!(db.mark_read(&msg.id, "b").unwrap());
        assert!(!db.mark_read(&msg.id, "b").unwrap());
        let unread = InboxQuery {
            unread_only: true,
            ..Default::default()
        };
        assert!(db.inbox("proj", "b", &unread).unwrap().is_empty());

        assert!(db.acknowledge(&msg.id, "b").unwrap());
        assert!(!db.acknowledge(&msg.id, "b").unwrap());
        assert!(db.inbox("proj", "b", &InboxQuery::default()).unwrap().is_empty());

        // Not a recipient.
        assert!(!db.acknowledge(&msg.id, "mallory").unwrap());
    }

    #[test]
    fn ack_implies_read() {
        let db = CoordinationDb::open_memory().unwrap();
        let msg = db
            .send_message("proj", "a", &["b"], "s", "b", &SendOptions::default())
            .unwrap();
        db.acknowledge(&msg.id, "b").unwrap();

        let r = &db.message_recipients(&msg.id).unwrap()[0];
        assert!(r.read_at.is_some());
        assert_eq!(r.read_at, r.acked_at);
    }

    #[test]
    fn inbox_limit_newest_first() {
        let db = CoordinationDb::open_memory().unwrap();
        for i in 0..4 {
            db.send_message("proj", "a", &["b"], &format!("m{i}"), "", &SendOptions::default())
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let inbox = db
            .inbox(
                "proj",
                "b",
                &InboxQuery {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].message.subject, "m3");
        assert_eq!(inbox[1].message.subject, "m2");
    }

    #[test]
    fn thread_messages_in_order() {
        let db = CoordinationDb::open_memory().unwrap();
        let opts = SendOptions {
            thread_id: Some("bd-123".into()),
            ..Default::default()
        };
        db.send_message("proj", "a", &["b"], "first", "", &opts).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.send_message("proj", "b", &["a"], "second", "", &opts).unwrap();
        db.send_message("proj", "a", &["b"], "elsewhere", "", &SendOptions::default())
            .unwrap();

        let thread = db.thread_messages("proj", "bd-123").unwrap();
        let subjects: Vec<_> = thread.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["first", "second"]);
    }

    #[test]
    fn reply_tree_walks_children_and_survives_cycles() {
        let db = CoordinationDb::open_memory().unwrap();
        let root = db
            .send_message("proj", "a", &["b"], "root", "", &SendOptions::default())
            .unwrap();
        let reply = |parent: &str, subject: &str| {
            db.send_message(
                "proj",
                "b",
                &["a"],
                subject,
                "",
                &SendOptions {
                    reply_to: Some(parent.to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
        };
        let child = reply(&root.id, "child");
        let grandchild = reply(&child.id, "grandchild");

        let tree = db.reply_tree(&root.id).unwrap();
        let subjects: Vec<_> = tree.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["root", "child", "grandchild"]);

        // Introduce a cycle: root now replies to grandchild.
        db.conn()
            .execute(
                "UPDATE messages SET reply_to = ?1 WHERE id = ?2",
                params![grandchild.id, root.id],
            )
            .unwrap();
        let tree = db.reply_tree(&root.id).unwrap();
        assert_eq!(tree.len(), 3);

        assert!(db.reply_tree("missing").unwrap().is_empty());
    }
}
