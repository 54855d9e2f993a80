//! Turn loosely shaped live payloads into canonical events.
//!
//! Push payloads are not guaranteed to match the shapes returned by the query
//! endpoints: ids may sit under `id` or `_id`, references may be bare ids or
//! embedded objects, timestamps may be epoch milliseconds or RFC 3339 text, and
//! optional fields may be missing. Anything without the ids needed to place it
//! is rejected here instead of half-applied later.

use chat_protocol::{
    chat_status, Attachment, AttachmentKind, ChatView, MessageStatus, MessageView,
    ReadReceipt, UserView,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// A live event in canonical shape.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    NewMessage(MessageView),
    MessageDelivered {
        message_id: Uuid,
        chat_id: Uuid,
        status: MessageStatus,
    },
    MessageRead {
        message_id: Uuid,
        chat_id: Uuid,
        read_by: Vec<ReadReceipt>,
        user_id: Uuid,
    },
    Typing {
        chat_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },
    NewChat(ChatView),
    PresenceChanged {
        user_id: Uuid,
        online: bool,
        last_seen: i64,
    },
    ProfileUpdated(UserView),
}

fn field<'a>(v: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| v.get(*n))
        .find(|f| !f.is_null())
}

fn str_field(v: &Value, names: &[&str]) -> Option<String> {
    field(v, names).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(v: &Value, names: &[&str]) -> Option<bool> {
    field(v, names).and_then(Value::as_bool)
}

/// Identity of an entity: a bare id string, or an object carrying `id`/`_id`.
pub fn id_of(v: &Value) -> Option<Uuid> {
    match v {
        Value::String(s) => Uuid::parse_str(s).ok(),
        Value::Object(_) => field(v, &["id", "_id"]).and_then(id_of),
        _ => None,
    }
}

fn ref_field(v: &Value, names: &[&str]) -> Option<Uuid> {
    field(v, names).and_then(id_of)
}

/// Epoch milliseconds from a number, a numeric string or RFC 3339 text.
pub fn timestamp(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            OffsetDateTime::parse(s, &Rfc3339)
                .ok()
                .map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64)
        }),
        _ => None,
    }
}

fn time_field(v: &Value, names: &[&str]) -> Option<i64> {
    field(v, names).and_then(timestamp)
}

pub fn user(v: &Value) -> Option<UserView> {
    let id = id_of(v)?;
    let username = str_field(v, &["username"]).unwrap_or_default();
    Some(UserView {
        id,
        display_name: str_field(v, &["displayName", "display_name", "name"])
            .unwrap_or_else(|| username.clone()),
        username,
        avatar_url: str_field(v, &["avatarUrl", "avatar_url", "avatar"]),
        online: bool_field(v, &["online", "isOnline"]).unwrap_or(false),
        last_seen: time_field(v, &["lastSeen", "last_seen"]).unwrap_or(0),
    })
}

fn receipts(v: Option<&Value>) -> Vec<ReadReceipt> {
    let Some(Value::Array(items)) = v else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(_) => Some(ReadReceipt {
                user_id: id_of(item)?,
                read_at: 0,
            }),
            _ => Some(ReadReceipt {
                user_id: ref_field(item, &["userId", "user_id", "user"])?,
                read_at: time_field(item, &["readAt", "read_at"]).unwrap_or(0),
            }),
        })
        .collect()
}

fn attachment(v: &Value) -> Option<Attachment> {
    let url = str_field(v, &["url", "secureUrl", "secure_url"])?;
    let kind = str_field(v, &["kind", "type"])
        .and_then(|k| AttachmentKind::parse(&k))
        .unwrap_or(AttachmentKind::File);
    Some(Attachment {
        name: str_field(v, &["name", "originalName", "original_name"]).unwrap_or_default(),
        url,
        kind,
    })
}

pub fn message(v: &Value) -> Option<MessageView> {
    Some(MessageView {
        id: id_of(v)?,
        chat_id: ref_field(v, &["chatId", "chat_id", "chat"])?,
        sender_id: ref_field(v, &["senderId", "sender_id", "sender"])?,
        content: str_field(v, &["content", "text"]),
        attachment: field(v, &["attachment"]).and_then(attachment),
        status: str_field(v, &["status"])
            .and_then(|s| MessageStatus::parse(&s))
            .unwrap_or_default(),
        read_by: receipts(field(v, &["readBy", "read_by"])),
        created_at: time_field(v, &["createdAt", "created_at", "timestamp"]).unwrap_or(0),
    })
}

pub fn chat(v: &Value) -> Option<ChatView> {
    let id = id_of(v)?;
    let participants: Vec<UserView> = match field(v, &["participants"]) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|p| match p {
                Value::String(_) => id_of(p).map(|id| UserView {
                    id,
                    username: String::new(),
                    display_name: String::new(),
                    avatar_url: None,
                    online: false,
                    last_seen: 0,
                }),
                _ => user(p),
            })
            .collect(),
        _ => Vec::new(),
    };
    let last_message = field(v, &["lastMessage", "last_message"]).and_then(message);
    let ids: Vec<Uuid> = participants.iter().map(|p| p.id).collect();
    let message_status = chat_status(last_message.as_ref(), &ids);
    Some(ChatView {
        id,
        name: str_field(v, &["name"]),
        is_group: bool_field(v, &["isGroup", "is_group"]).unwrap_or(false),
        group_admin: ref_field(v, &["groupAdmin", "group_admin"]),
        message_status,
        last_message,
        unread_count: field(v, &["unreadCount", "unread_count"])
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        favorite: bool_field(v, &["favorite"]).unwrap_or(false),
        updated_at: time_field(v, &["updatedAt", "updated_at"]).unwrap_or(0),
        participants,
    })
}

/// Canonicalize a pushed frame. `None` for unknown events and payloads that
/// lack the ids needed to place them.
pub fn normalize(frame: &Value) -> Option<LiveEvent> {
    let name = str_field(frame, &["t", "event", "type"])?;
    let body = field(frame, &["data", "payload"]).unwrap_or(frame);
    let ev = match name.as_str() {
        "new-message" | "newMessage" | "messageAdded" => {
            LiveEvent::NewMessage(message(field(body, &["message"]).unwrap_or(body))?)
        }
        "message-delivered" | "messageDelivered" => LiveEvent::MessageDelivered {
            message_id: ref_field(body, &["messageId", "message_id", "message"])?,
            chat_id: ref_field(body, &["chatId", "chat_id", "chat"])?,
            status: str_field(body, &["status"])
                .and_then(|s| MessageStatus::parse(&s))
                .unwrap_or(MessageStatus::Delivered),
        },
        "message-read" | "messageRead" => LiveEvent::MessageRead {
            message_id: ref_field(body, &["messageId", "message_id", "message"])?,
            chat_id: ref_field(body, &["chatId", "chat_id", "chat"])?,
            read_by: receipts(field(body, &["readBy", "read_by"])),
            user_id: ref_field(body, &["userId", "user_id", "user", "readerId"])?,
        },
        "typing" => LiveEvent::Typing {
            chat_id: ref_field(body, &["chatId", "chat_id", "chat"])?,
            user_id: ref_field(body, &["userId", "user_id", "user"])?,
            is_typing: bool_field(body, &["isTyping", "is_typing", "typing"]).unwrap_or(true),
        },
        "new-chat" | "newChat" => LiveEvent::NewChat(chat(field(body, &["chat"]).unwrap_or(body))?),
        "presence-changed" | "presenceChanged" => LiveEvent::PresenceChanged {
            user_id: ref_field(body, &["userId", "user_id", "user"])?,
            online: bool_field(body, &["online", "isOnline"])?,
            last_seen: time_field(body, &["lastSeen", "last_seen"]).unwrap_or(0),
        },
        "profile-updated" | "profileUpdated" => {
            LiveEvent::ProfileUpdated(user(field(body, &["user"]).unwrap_or(body))?)
        }
        _ => return None,
    };
    Some(ev)
}
