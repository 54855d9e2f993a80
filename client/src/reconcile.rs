use crate::normalize::{normalize, LiveEvent};
use crate::snapshot::Snapshot;
use chat_protocol::{
    chat_status, sanitize, Attachment, ChatView, MessageStatus, MessageView, UserView,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// How far apart an optimistic copy and its confirmation may be stamped.
pub const OPTIMISTIC_WINDOW_MS: i64 = 30_000;

/// The chat currently open on screen, shared with the UI.
///
/// Read when an event is handled, never captured ahead of time.
#[derive(Debug, Clone, Default)]
pub struct ViewingHandle(Arc<RwLock<Option<Uuid>>>);

impl ViewingHandle {
    pub fn set(&self, chat_id: Option<Uuid>) {
        *self.0.write() = chat_id;
    }

    pub fn get(&self) -> Option<Uuid> {
        *self.0.read()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Unknown, duplicate or unplaceable; the next full fetch catches up.
    Discarded,
}

#[derive(Debug, Clone)]
struct Pending {
    provisional_id: Uuid,
    chat_id: Uuid,
    content: Option<String>,
    attachment_url: Option<String>,
    created_at: i64,
}

impl Pending {
    fn confirms(&self, msg: &MessageView) -> bool {
        self.chat_id == msg.chat_id
            && self.content == msg.content
            && self.attachment_url == msg.attachment.as_ref().map(|a| a.url.clone())
            && (self.created_at - msg.created_at).abs() <= OPTIMISTIC_WINDOW_MS
    }
}

/// Merges live events into a snapshot.
pub struct Reconciler {
    snapshot: Snapshot,
    viewing: ViewingHandle,
    pending: Vec<Pending>,
    /// Viewer reads already subtracted from an unread count.
    counted_reads: HashSet<Uuid>,
}

impl Reconciler {
    pub fn new(snapshot: Snapshot, viewing: ViewingHandle) -> Self {
        Self {
            snapshot,
            viewing,
            pending: Vec::new(),
            counted_reads: HashSet::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Swap in a full refetch. Optimistic entries the refetch already holds
    /// are settled; the rest survive.
    pub fn refresh(&mut self, mut snapshot: Snapshot) {
        let viewer = snapshot.viewer;
        let mut confirmed = HashSet::new();
        self.pending.retain(|p| {
            let hit = snapshot
                .messages
                .values()
                .find(|m| m.sender_id == viewer && !confirmed.contains(&m.id) && p.confirms(m));
            match hit {
                Some(m) => {
                    confirmed.insert(m.id);
                    false
                }
                None => true,
            }
        });
        for p in &self.pending {
            if let Some(msg) = self.snapshot.messages.get(&p.provisional_id) {
                snapshot.insert_message(msg.clone());
            }
        }
        self.snapshot = snapshot;
    }

    /// Render a message before the server has confirmed it. Returns the
    /// provisional id, or `None` if the chat is not known locally.
    pub fn send_optimistic(
        &mut self,
        chat_id: Uuid,
        content: Option<String>,
        attachment: Option<Attachment>,
        now_ms: i64,
    ) -> Option<Uuid> {
        if !self.snapshot.chats.contains_key(&chat_id) {
            return None;
        }
        let msg = MessageView {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: self.snapshot.viewer,
            content: content.map(|c| sanitize(&c)).filter(|c| !c.is_empty()),
            attachment,
            status: MessageStatus::Sent,
            read_by: Vec::new(),
            created_at: now_ms,
        };
        self.pending.push(Pending {
            provisional_id: msg.id,
            chat_id,
            content: msg.content.clone(),
            attachment_url: msg.attachment.as_ref().map(|a| a.url.clone()),
            created_at: now_ms,
        });
        let id = msg.id;
        self.snapshot.insert_message(msg.clone());
        self.set_last_message(&chat_id, msg);
        Some(id)
    }

    /// Drop an optimistic message whose send failed.
    pub fn fail_optimistic(&mut self, provisional_id: &Uuid) -> bool {
        let Some(pos) = self
            .pending
            .iter()
            .position(|p| &p.provisional_id == provisional_id)
        else {
            return false;
        };
        let pending = self.pending.remove(pos);
        self.snapshot.remove_message(provisional_id);
        let previous = self
            .snapshot
            .messages_in(&pending.chat_id)
            .last()
            .map(|m| (*m).clone());
        if let Some(chat) = self.snapshot.chats.get_mut(&pending.chat_id) {
            if chat.last_message.as_ref().map(|m| m.id) == Some(*provisional_id) {
                chat.last_message = previous;
                refresh_status(chat);
            }
        }
        true
    }

    /// Apply one raw frame from the live connection.
    pub fn apply(&mut self, frame: &Value) -> Outcome {
        match normalize(frame) {
            Some(ev) => self.apply_event(ev),
            None => {
                debug!(frame = %frame, "discarding unrecognized frame");
                Outcome::Discarded
            }
        }
    }

    pub fn apply_event(&mut self, ev: LiveEvent) -> Outcome {
        match ev {
            LiveEvent::NewMessage(msg) => self.new_message(msg),
            LiveEvent::MessageDelivered {
                message_id,
                chat_id,
                status,
            } => self.update_message(&chat_id, &message_id, |m| {
                if status == MessageStatus::Delivered {
                    m.status = MessageStatus::Delivered;
                }
            }),
            LiveEvent::MessageRead {
                message_id,
                chat_id,
                read_by,
                user_id,
            } => self.message_read(chat_id, message_id, read_by, user_id),
            LiveEvent::Typing {
                chat_id,
                user_id,
                is_typing,
            } => {
                if user_id == self.snapshot.viewer || !self.snapshot.chats.contains_key(&chat_id) {
                    return Outcome::Discarded;
                }
                let users = self.snapshot.typing.entry(chat_id).or_default();
                if is_typing {
                    users.insert(user_id);
                } else {
                    users.remove(&user_id);
                }
                Outcome::Applied
            }
            LiveEvent::NewChat(chat) => {
                if self.snapshot.chats.contains_key(&chat.id) {
                    return Outcome::Discarded;
                }
                let id = chat.id;
                self.snapshot.insert_chat(chat);
                self.snapshot.bump(&id);
                Outcome::Applied
            }
            LiveEvent::PresenceChanged {
                user_id,
                online,
                last_seen,
            } => {
                let Some(user) = self.snapshot.users.get_mut(&user_id) else {
                    return Outcome::Discarded;
                };
                user.online = online;
                user.last_seen = user.last_seen.max(last_seen);
                let user = user.clone();
                self.sync_participant(&user);
                Outcome::Applied
            }
            LiveEvent::ProfileUpdated(user) => {
                self.snapshot.upsert_user(user.clone());
                if let Some(known) = self.snapshot.users.get(&user.id).cloned() {
                    self.sync_participant(&known);
                }
                Outcome::Applied
            }
        }
    }

    fn new_message(&mut self, msg: MessageView) -> Outcome {
        let chat_id = msg.chat_id;
        if !self.snapshot.chats.contains_key(&chat_id) {
            return Outcome::Discarded;
        }
        if self.snapshot.messages.contains_key(&msg.id) {
            return Outcome::Discarded;
        }
        let viewer = self.snapshot.viewer;
        if msg.sender_id == viewer {
            if let Some(pos) = self.pending.iter().position(|p| p.confirms(&msg)) {
                let pending = self.pending.remove(pos);
                self.snapshot
                    .replace_message(&pending.provisional_id, msg.clone());
                self.set_last_message(&chat_id, msg);
                return Outcome::Applied;
            }
        }
        self.snapshot.insert_message(msg.clone());
        let from_other = msg.sender_id != viewer;
        self.set_last_message(&chat_id, msg);
        if from_other && self.viewing.get() != Some(chat_id) {
            if let Some(chat) = self.snapshot.chats.get_mut(&chat_id) {
                chat.unread_count += 1;
            }
        }
        if let Some(typing) = self.snapshot.typing.get_mut(&chat_id) {
            typing.clear();
        }
        Outcome::Applied
    }

    fn message_read(
        &mut self,
        chat_id: Uuid,
        message_id: Uuid,
        read_by: Vec<chat_protocol::ReadReceipt>,
        user_id: Uuid,
    ) -> Outcome {
        if !self.snapshot.chats.contains_key(&chat_id) {
            return Outcome::Discarded;
        }
        let already_read = match self.snapshot.messages.get(&message_id) {
            Some(m) => m.is_read_by(&user_id),
            None => self.counted_reads.contains(&message_id),
        };
        let outcome = self.update_message(&chat_id, &message_id, |m| {
            for r in &read_by {
                if !m.is_read_by(&r.user_id) {
                    m.read_by.push(r.clone());
                }
            }
        });
        if user_id == self.snapshot.viewer && !already_read {
            self.counted_reads.insert(message_id);
            if let Some(chat) = self.snapshot.chats.get_mut(&chat_id) {
                chat.unread_count = chat.unread_count.saturating_sub(1);
            }
            return Outcome::Applied;
        }
        outcome
    }

    /// Edit a message wherever it is held: the message store and the chat preview.
    fn update_message<F>(&mut self, chat_id: &Uuid, message_id: &Uuid, edit: F) -> Outcome
    where
        F: Fn(&mut MessageView),
    {
        let mut touched = false;
        if let Some(m) = self.snapshot.messages.get_mut(message_id) {
            edit(m);
            touched = true;
        }
        if let Some(chat) = self.snapshot.chats.get_mut(chat_id) {
            if let Some(last) = chat.last_message.as_mut().filter(|m| &m.id == message_id) {
                edit(last);
                refresh_status(chat);
                touched = true;
            }
        }
        if touched {
            Outcome::Applied
        } else {
            Outcome::Discarded
        }
    }

    /// Point the chat preview at `msg` if it is the newest, and move the chat up.
    fn set_last_message(&mut self, chat_id: &Uuid, msg: MessageView) {
        let Some(chat) = self.snapshot.chats.get_mut(chat_id) else {
            return;
        };
        let newer = chat
            .last_message
            .as_ref()
            .map(|m| m.created_at <= msg.created_at)
            .unwrap_or(true);
        if !newer {
            return;
        }
        chat.updated_at = chat.updated_at.max(msg.created_at);
        chat.last_message = Some(msg);
        refresh_status(chat);
        self.snapshot.bump(chat_id);
    }

    fn sync_participant(&mut self, user: &UserView) {
        for chat in self.snapshot.chats.values_mut() {
            for p in chat.participants.iter_mut().filter(|p| p.id == user.id) {
                *p = user.clone();
            }
        }
    }
}

/// The chat indicator always follows the current last message.
fn refresh_status(chat: &mut ChatView) {
    let ids = chat.participant_ids();
    chat.message_status = chat_status(chat.last_message.as_ref(), &ids);
}
