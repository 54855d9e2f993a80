use chat_protocol::{ChatView, MessageView, Profile, UserView};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Locally held state, keyed by entity id.
///
/// Chats keep their list order separately (head is the most recently active)
/// and each chat's messages are kept oldest first.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub viewer: Uuid,
    pub users: HashMap<Uuid, UserView>,
    pub chats: HashMap<Uuid, ChatView>,
    pub chat_order: Vec<Uuid>,
    pub messages: HashMap<Uuid, MessageView>,
    pub chat_messages: HashMap<Uuid, Vec<Uuid>>,
    pub favorites: HashSet<Uuid>,
    pub typing: HashMap<Uuid, HashSet<Uuid>>,
}

impl Snapshot {
    pub fn new(me: Profile) -> Self {
        let mut snap = Self {
            viewer: me.user.id,
            favorites: me.favorites.into_iter().collect(),
            ..Self::default()
        };
        snap.users.insert(me.user.id, me.user);
        snap
    }

    /// Replace the chat list with a fresh fetch, which comes most recent first.
    pub fn load_chats(&mut self, chats: Vec<ChatView>) {
        self.chats.clear();
        self.chat_order.clear();
        for chat in chats {
            self.chat_order.push(chat.id);
            self.insert_chat(chat);
        }
    }

    /// Merge a page of messages, which the server returns newest first.
    pub fn load_messages(&mut self, chat_id: Uuid, page: Vec<MessageView>) {
        for msg in page.into_iter().rev() {
            self.insert_message(msg);
        }
        if let Some(ids) = self.chat_messages.get_mut(&chat_id) {
            let messages = &self.messages;
            ids.sort_by_key(|id| messages.get(id).map(|m| m.created_at).unwrap_or_default());
        }
    }

    pub(crate) fn insert_chat(&mut self, chat: ChatView) {
        for p in &chat.participants {
            self.upsert_user(p.clone());
        }
        if let Some(last) = &chat.last_message {
            self.insert_message(last.clone());
        }
        self.chats.insert(chat.id, chat);
    }

    /// Known users keep their presence unless the incoming record is newer.
    pub(crate) fn upsert_user(&mut self, user: UserView) {
        match self.users.get_mut(&user.id) {
            Some(known) if known.last_seen > user.last_seen => {
                known.username = user.username;
                known.display_name = user.display_name;
                known.avatar_url = user.avatar_url;
            }
            Some(known) => *known = user,
            None => {
                self.users.insert(user.id, user);
            }
        }
    }

    /// Add a message in time order. Returns false if it was already present.
    pub(crate) fn insert_message(&mut self, msg: MessageView) -> bool {
        if self.messages.contains_key(&msg.id) {
            return false;
        }
        let ids = self.chat_messages.entry(msg.chat_id).or_default();
        let at = ids
            .iter()
            .rposition(|id| {
                self.messages
                    .get(id)
                    .map(|m| m.created_at <= msg.created_at)
                    .unwrap_or(true)
            })
            .map(|i| i + 1)
            .unwrap_or(0);
        ids.insert(at, msg.id);
        self.messages.insert(msg.id, msg);
        true
    }

    /// Swap a message's identity in place, keeping its list position.
    pub(crate) fn replace_message(&mut self, old: &Uuid, msg: MessageView) {
        self.messages.remove(old);
        let ids = self.chat_messages.entry(msg.chat_id).or_default();
        match ids.iter().position(|id| id == old) {
            Some(i) => ids[i] = msg.id,
            None => ids.push(msg.id),
        }
        self.messages.insert(msg.id, msg);
    }

    pub(crate) fn remove_message(&mut self, id: &Uuid) -> Option<MessageView> {
        let msg = self.messages.remove(id)?;
        if let Some(ids) = self.chat_messages.get_mut(&msg.chat_id) {
            ids.retain(|m| m != id);
        }
        Some(msg)
    }

    /// Move a chat to the head of the list.
    pub(crate) fn bump(&mut self, chat_id: &Uuid) {
        self.chat_order.retain(|id| id != chat_id);
        self.chat_order.insert(0, *chat_id);
    }

    pub fn chat(&self, id: &Uuid) -> Option<&ChatView> {
        self.chats.get(id)
    }

    /// Chats in list order.
    pub fn chat_list(&self) -> Vec<&ChatView> {
        self.chat_order
            .iter()
            .filter_map(|id| self.chats.get(id))
            .collect()
    }

    /// A chat's messages, oldest first.
    pub fn messages_in(&self, chat_id: &Uuid) -> Vec<&MessageView> {
        self.chat_messages
            .get(chat_id)
            .map(|ids| ids.iter().filter_map(|id| self.messages.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn unread_total(&self) -> u32 {
        self.chats.values().map(|c| c.unread_count).sum()
    }

    pub fn typing_in(&self, chat_id: &Uuid) -> Vec<Uuid> {
        self.typing
            .get(chat_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}
