use crate::db::{now_ms, uuid_at};
use crate::error::{ChatError, Result};
use crate::{chats, status};
use chat_protocol::{
    escape_markup, sanitize, strip_markup, Attachment, AttachmentKind, MessageStatus, MessageView,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use uuid::Uuid;

const MAX_ATTACHMENT_NAME: usize = 255;
pub const MAX_PAGE: usize = 100;

/// Body of a send request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

/// A validated message ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
}

fn validate_attachment(att: &Attachment) -> Result<Attachment> {
    let url = att.url.trim();
    let ok_url = url.starts_with("/api/files/")
        || url::Url::parse(url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
    let name = att.name.trim();
    if !ok_url || name.is_empty() || name.chars().count() > MAX_ATTACHMENT_NAME {
        return Err(ChatError::InvalidInput("invalid_attachment"));
    }
    Ok(Attachment {
        url: url.to_string(),
        kind: att.kind,
        name: sanitize(name),
    })
}

/// Validate and clean a send request before anything is written.
pub fn validate(input: &NewMessage, max_len: usize) -> Result<Draft> {
    let stripped = input
        .content
        .as_deref()
        .map(strip_markup)
        .filter(|s| !s.is_empty());
    if let Some(c) = &stripped {
        if c.chars().count() > max_len {
            return Err(ChatError::InvalidInput("content_too_long"));
        }
    }
    let content = stripped.as_deref().map(escape_markup);
    let attachment = input.attachment.as_ref().map(validate_attachment).transpose()?;
    if content.is_none() && attachment.is_none() {
        return Err(ChatError::InvalidInput("empty_message"));
    }
    Ok(Draft {
        content,
        attachment,
    })
}

/// A stored message plus the users whose soft-leave it undid.
#[derive(Debug, Clone)]
pub struct Stored {
    pub message: MessageView,
    pub revived: Vec<Uuid>,
}

/// Persist a message, make it the chat's last message and revive the chat.
pub fn create_message(
    conn: &mut Connection,
    chat_id: &Uuid,
    sender_id: &Uuid,
    draft: Draft,
) -> Result<Stored> {
    if !chats::is_member(conn, chat_id, sender_id)? {
        return Err(ChatError::NotFound);
    }
    let id = Uuid::new_v4();
    let now = now_ms();
    let tx = conn.transaction()?;
    let (url, kind, name) = match &draft.attachment {
        Some(a) => (Some(a.url.as_str()), Some(a.kind.as_str()), Some(a.name.as_str())),
        None => (None, None, None),
    };
    tx.execute(
        "INSERT INTO messages (id, chat_id, sender_id, content, attachment_url, attachment_kind, attachment_name, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'sent', ?8)",
        params![
            id.to_string(),
            chat_id.to_string(),
            sender_id.to_string(),
            draft.content,
            url,
            kind,
            name,
            now
        ],
    )?;
    tx.execute(
        "UPDATE chats SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![chat_id.to_string(), id.to_string(), now],
    )?;
    let revived = chats::revive(&tx, chat_id)?;
    tx.commit()?;
    Ok(Stored {
        message: MessageView {
            id,
            chat_id: *chat_id,
            sender_id: *sender_id,
            content: draft.content,
            attachment: draft.attachment,
            status: MessageStatus::Sent,
            read_by: Vec::new(),
            created_at: now,
        },
        revived,
    })
}

const MSG_COLS: &str = "id, chat_id, sender_id, content, attachment_url, attachment_kind, attachment_name, status, created_at";

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageView> {
    let url: Option<String> = row.get(4)?;
    let kind: Option<String> = row.get(5)?;
    let name: Option<String> = row.get(6)?;
    let attachment = url.map(|url| Attachment {
        url,
        kind: kind
            .as_deref()
            .and_then(AttachmentKind::parse)
            .unwrap_or(AttachmentKind::File),
        name: name.unwrap_or_default(),
    });
    Ok(MessageView {
        id: uuid_at(row, 0)?,
        chat_id: uuid_at(row, 1)?,
        sender_id: uuid_at(row, 2)?,
        content: row.get(3)?,
        attachment,
        status: MessageStatus::parse(&row.get::<_, String>(7)?).unwrap_or_default(),
        read_by: Vec::new(),
        created_at: row.get(8)?,
    })
}

/// Load a message with its receipts.
pub fn get_message(conn: &Connection, id: &Uuid) -> Result<Option<MessageView>> {
    let msg = conn
        .query_row(
            &format!("SELECT {MSG_COLS} FROM messages WHERE id = ?1"),
            [id.to_string()],
            row_to_msg,
        )
        .optional()?;
    match msg {
        Some(mut m) => {
            m.read_by = status::read_by(conn, id)?;
            Ok(Some(m))
        }
        None => Ok(None),
    }
}

/// Page through a chat's messages, newest first.
pub fn list_messages(
    conn: &Connection,
    chat_id: &Uuid,
    limit: usize,
    offset: usize,
) -> Result<Vec<MessageView>> {
    let limit = limit.clamp(1, MAX_PAGE);
    let mut stmt = conn.prepare(&format!(
        "SELECT {MSG_COLS} FROM messages WHERE chat_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let mut msgs = stmt
        .query_map(
            params![chat_id.to_string(), limit as i64, offset as i64],
            row_to_msg,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    for m in msgs.iter_mut() {
        m.read_by = status::read_by(conn, &m.id)?;
    }
    Ok(msgs)
}
