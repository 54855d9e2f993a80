//! Delivery and read state of messages.
//!
//! `sent -> delivered` is one-way and the read set only grows. Both
//! transitions are single conditional statements, so concurrent callers
//! cannot double-apply them, and repeating a transition is a successful no-op.

use crate::db::{now_ms, uuid_at};
use crate::error::{ChatError, Result};
use crate::{chats, messages};
use chat_protocol::{MessageView, ReadReceipt};
use rusqlite::{params, Connection};
use uuid::Uuid;

/// Outcome of a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// State changed; fan-out is due.
    Applied(MessageView),
    /// Already in the requested state, or the actor is the sender.
    Unchanged(MessageView),
}

impl Transition {
    pub fn message(&self) -> &MessageView {
        match self {
            Transition::Applied(m) | Transition::Unchanged(m) => m,
        }
    }

    pub fn into_message(self) -> MessageView {
        match self {
            Transition::Applied(m) | Transition::Unchanged(m) => m,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Receipts for a message in the order they were recorded.
pub fn read_by(conn: &Connection, message_id: &Uuid) -> Result<Vec<ReadReceipt>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, read_at FROM read_receipts WHERE message_id = ?1 ORDER BY read_at, rowid",
    )?;
    let receipts = stmt
        .query_map([message_id.to_string()], |row| {
            Ok(ReadReceipt {
                user_id: uuid_at(row, 0)?,
                read_at: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(receipts)
}

/// Load a message the actor is allowed to act on.
fn load_for(conn: &Connection, message_id: &Uuid, actor: &Uuid) -> Result<MessageView> {
    let msg = messages::get_message(conn, message_id)?.ok_or(ChatError::NotFound)?;
    if !chats::is_member(conn, &msg.chat_id, actor)? {
        return Err(ChatError::NotFound);
    }
    Ok(msg)
}

/// Flip a message to delivered on the first acknowledgement by a recipient.
pub fn mark_delivered(conn: &Connection, message_id: &Uuid, actor: &Uuid) -> Result<Transition> {
    let msg = load_for(conn, message_id, actor)?;
    if &msg.sender_id == actor {
        return Ok(Transition::Unchanged(msg));
    }
    let changed = conn.execute(
        "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND status = 'sent' AND sender_id <> ?2",
        params![message_id.to_string(), actor.to_string()],
    )?;
    let msg = messages::get_message(conn, message_id)?.ok_or(ChatError::NotFound)?;
    Ok(if changed == 1 {
        Transition::Applied(msg)
    } else {
        Transition::Unchanged(msg)
    })
}

/// Record that `actor` read the message. Appends at most once per user.
pub fn mark_read(conn: &Connection, message_id: &Uuid, actor: &Uuid) -> Result<Transition> {
    let msg = load_for(conn, message_id, actor)?;
    if &msg.sender_id == actor {
        return Ok(Transition::Unchanged(msg));
    }
    let changed = conn.execute(
        "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
        params![message_id.to_string(), actor.to_string(), now_ms()],
    )?;
    let msg = messages::get_message(conn, message_id)?.ok_or(ChatError::NotFound)?;
    Ok(if changed == 1 {
        Transition::Applied(msg)
    } else {
        Transition::Unchanged(msg)
    })
}

/// Messages in the chat from others that the user has not read.
pub fn unread_count(conn: &Connection, chat_id: &Uuid, user_id: &Uuid) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages m WHERE m.chat_id = ?1 AND m.sender_id <> ?2 \
         AND NOT EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.user_id = ?2)",
        params![chat_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}
