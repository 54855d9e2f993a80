use crate::db::{now_ms, uuid_at};
use crate::error::{ChatError, Result};
use crate::users::{row_to_user, USER_COLS};
use crate::{messages, status};
use chat_protocol::{ChatView, UserView};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 100;

/// Deterministic id for the direct chat between two users.
pub fn dm_chat_id(a: &Uuid, b: &Uuid) -> Uuid {
    let (min, max) = if a < b { (a, b) } else { (b, a) };
    let name = format!("dm:{}:{}", min, max);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Persisted chat row without derived fields.
#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: Uuid,
    pub name: Option<String>,
    pub is_group: bool,
    pub group_admin: Option<Uuid>,
    pub last_message_id: Option<Uuid>,
    pub updated_at: i64,
}

/// Result of a create request.
#[derive(Debug, Clone)]
pub struct Created {
    pub chat_id: Uuid,
    /// False when an existing direct chat was returned.
    pub is_new: bool,
}

/// What a leave did to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Left {
    /// Removed from a group's participants.
    Removed,
    /// Direct chat hidden for the caller only.
    SoftDeleted,
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    let admin: Option<String> = row.get(3)?;
    let last: Option<String> = row.get(4)?;
    Ok(ChatRow {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        is_group: row.get::<_, i64>(2)? != 0,
        group_admin: admin.and_then(|s| Uuid::parse_str(&s).ok()),
        last_message_id: last.and_then(|s| Uuid::parse_str(&s).ok()),
        updated_at: row.get(5)?,
    })
}

pub fn get_chat(conn: &Connection, chat_id: &Uuid) -> Result<Option<ChatRow>> {
    let chat = conn
        .query_row(
            "SELECT id, name, is_group, group_admin, last_message_id, updated_at FROM chats WHERE id = ?1",
            [chat_id.to_string()],
            row_to_chat,
        )
        .optional()?;
    Ok(chat)
}

fn user_exists(conn: &Connection, id: &Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id.to_string()], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn add_participant(tx: &Transaction<'_>, chat_id: &Uuid, user_id: &Uuid, position: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
        params![chat_id.to_string(), user_id.to_string(), position],
    )?;
    Ok(())
}

/// Create or fetch the direct chat between `me` and `other`.
///
/// An existing chat the caller had soft-left becomes visible to them again.
pub fn get_or_create_direct(conn: &mut Connection, me: &Uuid, other: &Uuid) -> Result<Created> {
    if me == other {
        return Err(ChatError::InvalidInput("invalid_participants"));
    }
    if !user_exists(conn, other)? {
        return Err(ChatError::NotFound);
    }
    let id = dm_chat_id(me, other);
    let now = now_ms();
    let tx = conn.transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO chats (id, name, is_group, created_at, updated_at) VALUES (?1, NULL, 0, ?2, ?2)",
        params![id.to_string(), now],
    )?;
    if inserted == 1 {
        add_participant(&tx, &id, me, 0)?;
        add_participant(&tx, &id, other, 1)?;
    } else {
        tx.execute(
            "DELETE FROM chat_deleted_by WHERE chat_id = ?1 AND user_id = ?2",
            params![id.to_string(), me.to_string()],
        )?;
    }
    tx.commit()?;
    Ok(Created {
        chat_id: id,
        is_new: inserted == 1,
    })
}

/// Create a named group with the caller as admin.
pub fn create_group(conn: &mut Connection, me: &Uuid, others: &[Uuid], name: &str) -> Result<Created> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::InvalidInput("group_name_required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ChatError::InvalidInput("name_too_long"));
    }
    let mut members: Vec<Uuid> = Vec::with_capacity(others.len() + 1);
    members.push(*me);
    for id in others {
        if !members.contains(id) {
            members.push(*id);
        }
    }
    if members.len() < 2 {
        return Err(ChatError::InvalidInput("invalid_participants"));
    }
    for id in &members[1..] {
        if !user_exists(conn, id)? {
            return Err(ChatError::NotFound);
        }
    }
    let id = Uuid::new_v4();
    let now = now_ms();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO chats (id, name, is_group, group_admin, created_at, updated_at) VALUES (?1, ?2, 1, ?3, ?4, ?4)",
        params![id.to_string(), name, me.to_string(), now],
    )?;
    for (pos, user) in members.iter().enumerate() {
        add_participant(&tx, &id, user, pos as i64)?;
    }
    tx.commit()?;
    Ok(Created {
        chat_id: id,
        is_new: true,
    })
}

/// Participant of the chat, soft-deleted or not.
pub fn is_member(conn: &Connection, chat_id: &Uuid, user_id: &Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.to_string(), user_id.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Participant who has not soft-left the chat.
pub fn is_active_member(conn: &Connection, chat_id: &Uuid, user_id: &Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM chat_participants p WHERE p.chat_id = ?1 AND p.user_id = ?2 \
             AND NOT EXISTS (SELECT 1 FROM chat_deleted_by d WHERE d.chat_id = p.chat_id AND d.user_id = p.user_id)",
            params![chat_id.to_string(), user_id.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Participant ids in join order.
pub fn participant_ids(conn: &Connection, chat_id: &Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map([chat_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn participants(conn: &Connection, chat_id: &Uuid) -> Result<Vec<UserView>> {
    let cols = USER_COLS
        .split(", ")
        .map(|c| format!("u.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {cols} FROM chat_participants p JOIN users u ON u.id = p.user_id \
         WHERE p.chat_id = ?1 ORDER BY p.position"
    ))?;
    let users = stmt
        .query_map([chat_id.to_string()], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Ids of every chat the user currently sees, most recent first.
pub fn active_chat_ids(conn: &Connection, user_id: &Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM chats c JOIN chat_participants p ON p.chat_id = c.id \
         WHERE p.user_id = ?1 \
         AND NOT EXISTS (SELECT 1 FROM chat_deleted_by d WHERE d.chat_id = c.id AND d.user_id = ?1) \
         ORDER BY c.updated_at DESC, c.rowid DESC",
    )?;
    let ids = stmt
        .query_map([user_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Un-hide the chat for everyone who soft-left it. Returns who came back.
pub fn revive(conn: &Connection, chat_id: &Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare("SELECT user_id FROM chat_deleted_by WHERE chat_id = ?1")?;
    let revived = stmt
        .query_map([chat_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    if !revived.is_empty() {
        conn.execute(
            "DELETE FROM chat_deleted_by WHERE chat_id = ?1",
            [chat_id.to_string()],
        )?;
    }
    Ok(revived)
}

/// Leave a chat: groups drop the participant, direct chats are soft-deleted.
pub fn leave(conn: &mut Connection, chat_id: &Uuid, user_id: &Uuid) -> Result<Left> {
    let chat = get_chat(conn, chat_id)?.ok_or(ChatError::NotFound)?;
    if !is_member(conn, chat_id, user_id)? {
        return Err(ChatError::NotFound);
    }
    let tx = conn.transaction()?;
    let left = if chat.is_group {
        tx.execute(
            "DELETE FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.to_string(), user_id.to_string()],
        )?;
        if chat.group_admin.as_ref() == Some(user_id) {
            // the longest-standing remaining member inherits the group
            tx.execute(
                "UPDATE chats SET group_admin = (SELECT user_id FROM chat_participants \
                 WHERE chat_id = ?1 ORDER BY position LIMIT 1) WHERE id = ?1",
                [chat_id.to_string()],
            )?;
        }
        Left::Removed
    } else {
        tx.execute(
            "INSERT OR IGNORE INTO chat_deleted_by (chat_id, user_id) VALUES (?1, ?2)",
            params![chat_id.to_string(), user_id.to_string()],
        )?;
        Left::SoftDeleted
    };
    tx.commit()?;
    Ok(left)
}

fn is_favorite(conn: &Connection, viewer: &Uuid, chat_id: &Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM favorites WHERE user_id = ?1 AND chat_id = ?2",
            params![viewer.to_string(), chat_id.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Materialize a chat as seen by `viewer`, derived fields included.
pub fn chat_view(conn: &Connection, chat_id: &Uuid, viewer: &Uuid) -> Result<ChatView> {
    let chat = get_chat(conn, chat_id)?.ok_or(ChatError::NotFound)?;
    let participants = participants(conn, chat_id)?;
    let ids: Vec<Uuid> = participants.iter().map(|p| p.id).collect();
    let last_message = match &chat.last_message_id {
        Some(id) => messages::get_message(conn, id)?,
        None => None,
    };
    Ok(ChatView {
        id: chat.id,
        name: chat.name,
        is_group: chat.is_group,
        group_admin: chat.group_admin,
        message_status: chat_protocol::chat_status(last_message.as_ref(), &ids),
        last_message,
        participants,
        unread_count: status::unread_count(conn, chat_id, viewer)?,
        favorite: is_favorite(conn, viewer, chat_id)?,
        updated_at: chat.updated_at,
    })
}

/// The viewer's chat list, most recently active first.
pub fn list_chats(conn: &Connection, viewer: &Uuid) -> Result<Vec<ChatView>> {
    active_chat_ids(conn, viewer)?
        .iter()
        .map(|id| chat_view(conn, id, viewer))
        .collect()
}
