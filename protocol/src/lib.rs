use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod text;

pub use text::{escape_markup, sanitize, strip_markup};

/// Sender-side delivery state of a single message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            _ => None,
        }
    }
}

/// Chat-level indicator derived from the chat's current last message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(AttachmentKind::Image),
            "video" => Some(AttachmentKind::Video),
            "file" | "document" => Some(AttachmentKind::File),
            _ => None,
        }
    }

    /// Classify an uploaded file by its MIME type.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            AttachmentKind::Image
        } else if mime.starts_with("video/") {
            AttachmentKind::Video
        } else {
            AttachmentKind::File
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub read_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: i64,
}

/// The caller's own account, including per-user annotations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(flatten)]
    pub user: UserView,
    #[serde(default)]
    pub favorites: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    pub created_at: i64,
}

impl MessageView {
    pub fn is_read_by(&self, user_id: &Uuid) -> bool {
        self.read_by.iter().any(|r| &r.user_id == user_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub is_group: bool,
    pub participants: Vec<UserView>,
    #[serde(default)]
    pub group_admin: Option<Uuid>,
    #[serde(default)]
    pub last_message: Option<MessageView>,
    #[serde(default)]
    pub message_status: ChatStatus,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub favorite: bool,
    pub updated_at: i64,
}

impl ChatView {
    pub fn participant_ids(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.id).collect()
    }
}

/// Derive a chat's status indicator from its current last message.
///
/// `read` once every participant other than the sender has a receipt,
/// `delivered` once the message was acknowledged or read by anyone,
/// `sent` otherwise.
pub fn chat_status(last: Option<&MessageView>, participants: &[Uuid]) -> ChatStatus {
    let Some(msg) = last else {
        return ChatStatus::Sent;
    };
    let mut others = participants
        .iter()
        .filter(|p| **p != msg.sender_id)
        .peekable();
    if others.peek().is_some() && others.all(|p| msg.is_read_by(p)) {
        return ChatStatus::Read;
    }
    if msg.status == MessageStatus::Delivered || !msg.read_by.is_empty() {
        ChatStatus::Delivered
    } else {
        ChatStatus::Sent
    }
}

/// Events pushed from the server over a live connection or a push topic.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Hello { user_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Joined { chat_ids: Vec<Uuid> },
    #[serde(rename_all = "camelCase")]
    Left { chat_id: Uuid },
    #[serde(rename_all = "camelCase")]
    NewMessage { message: MessageView },
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: Uuid,
        chat_id: Uuid,
        status: MessageStatus,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: Uuid,
        chat_id: Uuid,
        read_by: Vec<ReadReceipt>,
        user_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        chat_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    NewChat { chat: ChatView },
    #[serde(rename_all = "camelCase")]
    PresenceChanged {
        user_id: Uuid,
        online: bool,
        last_seen: i64,
    },
    #[serde(rename_all = "camelCase")]
    ProfileUpdated { user: UserView },
    Error { error: String },
}

impl ServerEvent {
    /// Wire name of the event, as found in the `t` field.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Hello { .. } => "hello",
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::Left { .. } => "left",
            ServerEvent::NewMessage { .. } => "new-message",
            ServerEvent::MessageDelivered { .. } => "message-delivered",
            ServerEvent::MessageRead { .. } => "message-read",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::NewChat { .. } => "new-chat",
            ServerEvent::PresenceChanged { .. } => "presence-changed",
            ServerEvent::ProfileUpdated { .. } => "profile-updated",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Commands a client sends over its live connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    Join { chat_ids: Vec<Uuid> },
    #[serde(rename_all = "camelCase")]
    Leave { chat_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: Uuid, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    Delivered { message_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Read { message_id: Uuid },
}
