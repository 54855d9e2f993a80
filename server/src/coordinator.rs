//! Mutations of chat state and the fan-out that follows them.
//!
//! Every operation validates, writes through the store, derives the views it
//! needs from the stored state and only then notifies. Notification is
//! best-effort: the store is the source of truth and a lost event never fails
//! the originating call.

use crate::chats::{self, Created, Left};
use crate::config::ChatSettings;
use crate::db::{now_ms, Db};
use crate::error::{ChatError, Result};
use crate::messages::{self, NewMessage};
use crate::presence::Presence;
use crate::push::{chat_topic, PushHub};
use crate::registry::{ConnId, Registry, Room};
use crate::status::{self, Transition};
use crate::typing::TypingTracker;
use crate::users;
use chat_protocol::{ChatView, MessageView, Profile, ServerEvent, UserView};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

/// Body of a create-chat request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChat {
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of a profile update. Absent fields are left alone; an empty avatar clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Clone)]
pub struct Coordinator {
    db: Db,
    registry: Arc<Registry>,
    push: Arc<PushHub>,
    presence: Arc<Presence>,
    typing: Arc<TypingTracker>,
    max_content_len: usize,
}

impl Coordinator {
    pub fn new(db: Db, settings: &ChatSettings) -> Self {
        Self {
            db,
            registry: Arc::new(Registry::new(settings.connection_queue)),
            push: Arc::new(PushHub::new(settings.connection_queue)),
            presence: Arc::new(Presence::new(settings.presence_grace)),
            typing: Arc::new(TypingTracker::new(settings.typing_throttle)),
            max_content_len: settings.max_content_len,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Validate, store and fan out a new message.
    pub async fn send_message(
        &self,
        sender: &Uuid,
        chat_id: Uuid,
        input: NewMessage,
    ) -> Result<MessageView> {
        let draft = messages::validate(&input, self.max_content_len)?;
        let sender_id = *sender;
        let stored = self
            .db
            .run(move |c| messages::create_message(c, &chat_id, &sender_id, draft))
            .await?;

        if !stored.revived.is_empty() {
            // whoever had hidden the chat gets it back before the message lands
            let revived = stored.revived.clone();
            let views = self
                .db
                .run(move |c| {
                    revived
                        .iter()
                        .map(|u| -> Result<(Uuid, ChatView)> { Ok((*u, chats::chat_view(c, &chat_id, u)?)) })
                        .collect::<Result<Vec<_>>>()
                })
                .await;
            match views {
                Ok(views) => {
                    for (user, chat) in views {
                        self.registry.join_user(&user, Room::Chat(chat_id));
                        self.registry
                            .broadcast(Room::User(user), &ServerEvent::NewChat { chat }, None);
                    }
                }
                Err(e) => debug!(chat_id = %chat_id, error = %e, "skipping revive fan-out"),
            }
        }

        let event = ServerEvent::NewMessage {
            message: stored.message.clone(),
        };
        let live = self.registry.broadcast(Room::Chat(chat_id), &event, None);
        let pushed = self.push.publish(&chat_topic(&chat_id), event);
        debug!(chat_id = %chat_id, message_id = %stored.message.id, live, pushed, "message fanned out");
        Ok(stored.message)
    }

    /// Acknowledge receipt of a message by a recipient.
    pub async fn mark_delivered(&self, actor: &Uuid, message_id: Uuid) -> Result<MessageView> {
        let actor_id = *actor;
        let transition = self
            .db
            .run(move |c| status::mark_delivered(c, &message_id, &actor_id))
            .await?;
        if let Transition::Applied(msg) = &transition {
            self.registry.broadcast(
                Room::Chat(msg.chat_id),
                &ServerEvent::MessageDelivered {
                    message_id: msg.id,
                    chat_id: msg.chat_id,
                    status: msg.status,
                },
                None,
            );
        }
        Ok(transition.into_message())
    }

    /// Record that the actor read a message.
    pub async fn mark_read(&self, actor: &Uuid, message_id: Uuid) -> Result<MessageView> {
        let actor_id = *actor;
        let transition = self
            .db
            .run(move |c| status::mark_read(c, &message_id, &actor_id))
            .await?;
        if let Transition::Applied(msg) = &transition {
            self.registry.broadcast(
                Room::Chat(msg.chat_id),
                &ServerEvent::MessageRead {
                    message_id: msg.id,
                    chat_id: msg.chat_id,
                    read_by: msg.read_by.clone(),
                    user_id: actor_id,
                },
                None,
            );
        }
        Ok(transition.into_message())
    }

    /// Create a group, or find-or-create the direct chat with one other user.
    pub async fn create_chat(&self, creator: &Uuid, req: CreateChat) -> Result<ChatView> {
        let me = *creator;
        let mut others: Vec<Uuid> = Vec::new();
        for id in req.participant_ids {
            if id != me && !others.contains(&id) {
                others.push(id);
            }
        }
        if others.is_empty() || (!req.is_group && others.len() != 1) {
            return Err(ChatError::InvalidInput("invalid_participants"));
        }
        let name = req.name.unwrap_or_default();
        let (created, views) = self
            .db
            .run(move |c| {
                let created = if req.is_group {
                    chats::create_group(c, &me, &others, &name)?
                } else {
                    chats::get_or_create_direct(c, &me, &others[0])?
                };
                let ids = if created.is_new {
                    chats::participant_ids(c, &created.chat_id)?
                } else {
                    vec![me]
                };
                let views = ids
                    .iter()
                    .map(|u| -> Result<(Uuid, ChatView)> { Ok((*u, chats::chat_view(c, &created.chat_id, u)?)) })
                    .collect::<Result<Vec<_>>>()?;
                Ok((created, views))
            })
            .await?;
        let Created { chat_id, is_new } = created;

        let mut own = None;
        for (user, chat) in views {
            self.registry.join_user(&user, Room::Chat(chat_id));
            if user == me {
                own = Some(chat);
            } else {
                self.registry
                    .broadcast(Room::User(user), &ServerEvent::NewChat { chat }, None);
            }
        }
        if is_new {
            info!(chat_id = %chat_id, creator = %me, "chat created");
        }
        own.ok_or(ChatError::NotFound)
    }

    /// Leave a group or hide a direct chat. Stops room delivery right away.
    pub async fn leave_chat(&self, actor: &Uuid, chat_id: Uuid) -> Result<Left> {
        let user = *actor;
        let left = self
            .db
            .run(move |c| chats::leave(c, &chat_id, &user))
            .await?;
        self.registry.leave_user(&user, Room::Chat(chat_id));
        self.registry
            .broadcast(Room::User(user), &ServerEvent::Left { chat_id }, None);
        info!(chat_id = %chat_id, user_id = %user, ?left, "left chat");
        Ok(left)
    }

    /// Flip a chat in the caller's favorites and return the updated profile.
    pub async fn toggle_favorite(&self, actor: &Uuid, chat_id: Uuid) -> Result<Profile> {
        let user = *actor;
        self.db
            .run(move |c| {
                users::toggle_favorite(c, &user, &chat_id)?;
                users::get_profile(c, &user)
            })
            .await
    }

    /// Relay a typing signal to the other members of the chat.
    pub async fn typing(&self, actor: &Uuid, chat_id: Uuid, is_typing: bool) -> Result<()> {
        let user = *actor;
        let allowed = self
            .db
            .run(move |c| chats::is_active_member(c, &chat_id, &user))
            .await?;
        if !allowed {
            return Err(ChatError::NotFound);
        }
        if self.typing.typing(user, chat_id, is_typing) {
            self.registry.broadcast(
                Room::Chat(chat_id),
                &ServerEvent::Typing {
                    chat_id,
                    user_id: user,
                    is_typing,
                },
                Some(&user),
            );
        }
        Ok(())
    }

    /// Join a connection to the chat rooms its user currently belongs to.
    /// Returns the chats actually joined; anything else is ignored.
    pub async fn join_chats(&self, conn_id: ConnId, chat_ids: Vec<Uuid>) -> Result<Vec<Uuid>> {
        let user = self
            .registry
            .user_of(conn_id)
            .ok_or(ChatError::Unauthenticated)?;
        let allowed = self
            .db
            .run(move |c| {
                let mut ok = Vec::new();
                for id in chat_ids {
                    if !ok.contains(&id) && chats::is_active_member(c, &id, &user)? {
                        ok.push(id);
                    }
                }
                Ok(ok)
            })
            .await?;
        for id in &allowed {
            self.registry.join(conn_id, Room::Chat(*id));
        }
        Ok(allowed)
    }

    pub fn leave_room(&self, conn_id: ConnId, chat_id: Uuid) {
        self.registry.leave(conn_id, Room::Chat(chat_id));
    }

    /// Register a live connection, greeting it and announcing presence if the
    /// user just came online.
    pub async fn connection_opened(&self, user_id: Uuid) -> (ConnId, mpsc::Receiver<Arc<str>>) {
        let (conn_id, rx) = self.registry.register(user_id);
        self.registry
            .send_to(conn_id, &ServerEvent::Hello { user_id });
        if self.presence.connect(user_id) {
            self.announce_presence(user_id, true).await;
        }
        debug!(conn_id, user_id = %user_id, "connection opened");
        (conn_id, rx)
    }

    /// Drop a connection. If it was the user's last one, they go offline once
    /// the grace window passes without a reconnect.
    pub fn connection_closed(&self, conn_id: ConnId, user_id: Uuid) {
        self.registry.unregister(conn_id);
        debug!(conn_id, user_id = %user_id, "connection closed");
        let this = self.clone();
        tokio::spawn(async move {
            if this.presence.disconnect(user_id).await {
                this.announce_presence(user_id, false).await;
            }
        });
    }

    async fn announce_presence(&self, user_id: Uuid, online: bool) {
        let at = now_ms();
        let chat_ids = self
            .db
            .run(move |c| {
                users::set_presence(c, &user_id, online, at)?;
                chats::active_chat_ids(c, &user_id)
            })
            .await;
        match chat_ids {
            Ok(ids) => {
                let rooms: Vec<Room> = ids.into_iter().map(Room::Chat).collect();
                let reached = self.registry.broadcast_many(
                    &rooms,
                    &ServerEvent::PresenceChanged {
                        user_id,
                        online,
                        last_seen: at,
                    },
                    Some(&user_id),
                );
                info!(user_id = %user_id, online, reached, "presence changed");
            }
            Err(e) => debug!(user_id = %user_id, error = %e, "presence not persisted"),
        }
    }

    /// Change username or avatar and tell every room the user is part of.
    pub async fn update_profile(&self, actor: &Uuid, update: ProfileUpdate) -> Result<UserView> {
        let user_id = *actor;
        let (user, chat_ids) = self
            .db
            .run(move |c| {
                let user = users::update_profile(
                    c,
                    &user_id,
                    update.username.as_deref(),
                    update.avatar_url.as_deref(),
                )?;
                Ok((user, chats::active_chat_ids(c, &user_id)?))
            })
            .await?;
        let mut rooms = vec![Room::User(user_id)];
        rooms.extend(chat_ids.into_iter().map(Room::Chat));
        self.registry.broadcast_many(
            &rooms,
            &ServerEvent::ProfileUpdated { user: user.clone() },
            None,
        );
        Ok(user)
    }

    pub async fn get_profile(&self, actor: &Uuid) -> Result<Profile> {
        let user_id = *actor;
        self.db.run(move |c| users::get_profile(c, &user_id)).await
    }

    pub async fn get_user(&self, id: Uuid) -> Result<UserView> {
        self.db
            .run(move |c| users::get_user(c, &id))
            .await?
            .ok_or(ChatError::NotFound)
    }

    pub async fn search_users(&self, actor: &Uuid, search: Option<String>) -> Result<Vec<UserView>> {
        let user_id = *actor;
        self.db
            .run(move |c| users::search_users(c, &user_id, search.as_deref()))
            .await
    }

    pub async fn list_chats(&self, actor: &Uuid) -> Result<Vec<ChatView>> {
        let user_id = *actor;
        self.db.run(move |c| chats::list_chats(c, &user_id)).await
    }

    /// A page of a chat's messages, newest first.
    pub async fn get_messages(
        &self,
        actor: &Uuid,
        chat_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageView>> {
        let user_id = *actor;
        self.db
            .run(move |c| {
                if !chats::is_member(c, &chat_id, &user_id)? {
                    return Err(ChatError::NotFound);
                }
                messages::list_messages(c, &chat_id, limit, offset)
            })
            .await
    }

    /// Subscribe to a chat's push topic after checking participation.
    pub async fn subscribe_chat(
        &self,
        actor: &Uuid,
        chat_id: Uuid,
    ) -> Result<broadcast::Receiver<ServerEvent>> {
        let user_id = *actor;
        let allowed = self
            .db
            .run(move |c| chats::is_active_member(c, &chat_id, &user_id))
            .await?;
        if !allowed {
            return Err(ChatError::NotFound);
        }
        Ok(self.push.subscribe(&chat_topic(&chat_id)))
    }

    /// Register a user record. Used by the `add-user` command and tests.
    pub async fn add_user(&self, username: &str, display_name: &str) -> Result<UserView> {
        let (username, display_name) = (username.to_string(), display_name.to_string());
        self.db
            .run(move |c| users::create_user(c, &username, &display_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_protocol::{ChatStatus, MessageStatus};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        co: Coordinator,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::open(tmp.path().join("chat.db")).unwrap();
        let settings = ChatSettings {
            presence_grace: Duration::from_millis(50),
            typing_throttle: Duration::from_secs(1),
            ..ChatSettings::default()
        };
        Fixture {
            _tmp: tmp,
            co: Coordinator::new(db, &settings),
        }
    }

    fn text(s: &str) -> NewMessage {
        NewMessage {
            content: Some(s.into()),
            attachment: None,
        }
    }

    fn direct(with: Uuid) -> CreateChat {
        CreateChat {
            participant_ids: vec![with],
            is_group: false,
            name: None,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Arc<str>>) -> ServerEvent {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn hi_is_pushed_read_and_reflected_in_status() {
        let f = fixture();
        let a = f.co.add_user("alice", "Alice").await.unwrap();
        let b = f.co.add_user("bob", "Bob").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();

        let (ca, mut ra) = f.co.connection_opened(a.id).await;
        let (cb, mut rb) = f.co.connection_opened(b.id).await;
        assert!(matches!(next_event(&mut ra).await, ServerEvent::Hello { .. }));
        assert!(matches!(next_event(&mut rb).await, ServerEvent::Hello { .. }));
        // alice hears that bob came online once both share the chat room
        f.co.join_chats(ca, vec![chat.id]).await.unwrap();
        f.co.join_chats(cb, vec![chat.id]).await.unwrap();

        let msg = f.co.send_message(&a.id, chat.id, text("hi")).await.unwrap();
        match next_event(&mut rb).await {
            ServerEvent::NewMessage { message } => {
                assert_eq!(message.id, msg.id);
                assert_eq!(message.status, MessageStatus::Sent);
            }
            other => panic!("unexpected {other:?}"),
        }

        f.co.mark_read(&b.id, msg.id).await.unwrap();
        // skip alice's own echo of the new message
        loop {
            match next_event(&mut ra).await {
                ServerEvent::MessageRead { read_by, user_id, .. } => {
                    assert_eq!(user_id, b.id);
                    assert!(read_by.iter().any(|r| r.user_id == b.id));
                    break;
                }
                _ => continue,
            }
        }
        let chats = f.co.list_chats(&a.id).await.unwrap();
        assert_eq!(chats[0].message_status, ChatStatus::Read);
    }

    #[tokio::test]
    async fn redundant_transitions_emit_nothing() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        let (ca, mut ra) = f.co.connection_opened(a.id).await;
        f.co.join_chats(ca, vec![chat.id]).await.unwrap();
        let msg = f.co.send_message(&a.id, chat.id, text("x")).await.unwrap();
        while ra.try_recv().is_ok() {}

        f.co.mark_delivered(&b.id, msg.id).await.unwrap();
        assert!(matches!(
            next_event(&mut ra).await,
            ServerEvent::MessageDelivered { .. }
        ));
        let again = f.co.mark_delivered(&b.id, msg.id).await.unwrap();
        assert_eq!(again.status, MessageStatus::Delivered);
        f.co.mark_read(&b.id, msg.id).await.unwrap();
        next_event(&mut ra).await;
        let again = f.co.mark_read(&b.id, msg.id).await.unwrap();
        assert_eq!(again.read_by.len(), 1);
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn validation_happens_before_writes() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        assert!(matches!(
            f.co.send_message(&a.id, chat.id, text("  ")).await,
            Err(ChatError::InvalidInput("empty_message"))
        ));
        assert!(f.co.get_messages(&a.id, chat.id, 50, 0).await.unwrap().is_empty());
        let stranger = f.co.add_user("carol", "").await.unwrap();
        assert!(matches!(
            f.co.send_message(&stranger.id, chat.id, text("x")).await,
            Err(ChatError::NotFound)
        ));
        assert!(matches!(
            f.co.create_chat(&a.id, CreateChat::default()).await,
            Err(ChatError::InvalidInput("invalid_participants"))
        ));
        assert!(matches!(
            f.co
                .create_chat(
                    &a.id,
                    CreateChat {
                        participant_ids: vec![b.id, stranger.id],
                        is_group: false,
                        name: None
                    }
                )
                .await,
            Err(ChatError::InvalidInput("invalid_participants"))
        ));
    }

    #[tokio::test]
    async fn new_chat_goes_to_others_and_joins_their_connections() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let c = f.co.add_user("carol", "").await.unwrap();
        let (_ca, mut ra) = f.co.connection_opened(a.id).await;
        let (cb, mut rb) = f.co.connection_opened(b.id).await;
        next_event(&mut ra).await;
        next_event(&mut rb).await;

        let group = f
            .co
            .create_chat(
                &a.id,
                CreateChat {
                    participant_ids: vec![b.id, c.id],
                    is_group: true,
                    name: Some(" Trip ".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(group.name.as_deref(), Some("Trip"));
        assert_eq!(group.group_admin, Some(a.id));
        match next_event(&mut rb).await {
            ServerEvent::NewChat { chat } => assert_eq!(chat.id, group.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(f.co.registry().is_joined(cb, Room::Chat(group.id)));
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_only_admits_current_members() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let c = f.co.add_user("carol", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        let (cc, _rc) = f.co.connection_opened(c.id).await;
        assert!(f.co.join_chats(cc, vec![chat.id]).await.unwrap().is_empty());

        let (ca, _ra) = f.co.connection_opened(a.id).await;
        f.co.leave_chat(&a.id, chat.id).await.unwrap();
        assert!(!f.co.registry().is_joined(ca, Room::Chat(chat.id)));
        assert!(f.co.join_chats(ca, vec![chat.id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revived_chat_reappears_for_the_leaver() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        f.co.leave_chat(&a.id, chat.id).await.unwrap();
        assert!(f.co.list_chats(&a.id).await.unwrap().is_empty());

        let (ca, mut ra) = f.co.connection_opened(a.id).await;
        next_event(&mut ra).await;
        let msg = f.co.send_message(&b.id, chat.id, text("back?")).await.unwrap();
        match next_event(&mut ra).await {
            ServerEvent::NewChat { chat: view } => {
                assert_eq!(view.id, chat.id);
                assert_eq!(view.unread_count, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            next_event(&mut ra).await,
            ServerEvent::NewMessage { .. }
        ));
        assert!(f.co.registry().is_joined(ca, Room::Chat(chat.id)));
        let list = f.co.list_chats(&a.id).await.unwrap();
        assert_eq!(list[0].last_message.as_ref().map(|m| m.id), Some(msg.id));
    }

    #[tokio::test]
    async fn presence_survives_a_second_tab_and_expires_after_grace() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        let (ca, mut ra) = f.co.connection_opened(a.id).await;
        f.co.join_chats(ca, vec![chat.id]).await.unwrap();
        next_event(&mut ra).await;

        let (b1, _r1) = f.co.connection_opened(b.id).await;
        assert!(matches!(
            next_event(&mut ra).await,
            ServerEvent::PresenceChanged { online: true, .. }
        ));
        let (b2, _r2) = f.co.connection_opened(b.id).await;
        f.co.connection_closed(b1, b.id);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(f.co.presence().is_online(&b.id));
        assert!(ra.try_recv().is_err());

        f.co.connection_closed(b2, b.id);
        match next_event(&mut ra).await {
            ServerEvent::PresenceChanged { user_id, online, .. } => {
                assert_eq!(user_id, b.id);
                assert!(!online);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!f.co.get_user(b.id).await.unwrap().online);
    }

    #[tokio::test]
    async fn typing_excludes_sender_and_throttles() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        let (ca, mut ra) = f.co.connection_opened(a.id).await;
        let (cb, mut rb) = f.co.connection_opened(b.id).await;
        f.co.join_chats(ca, vec![chat.id]).await.unwrap();
        f.co.join_chats(cb, vec![chat.id]).await.unwrap();
        while ra.try_recv().is_ok() {}
        while rb.try_recv().is_ok() {}

        f.co.typing(&a.id, chat.id, true).await.unwrap();
        f.co.typing(&a.id, chat.id, true).await.unwrap();
        assert!(matches!(
            next_event(&mut rb).await,
            ServerEvent::Typing { is_typing: true, .. }
        ));
        assert!(rb.try_recv().is_err());
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn profile_updates_and_favorites() {
        let f = fixture();
        let a = f.co.add_user("alice", "").await.unwrap();
        let b = f.co.add_user("bob", "").await.unwrap();
        let chat = f.co.create_chat(&a.id, direct(b.id)).await.unwrap();
        let (cb, mut rb) = f.co.connection_opened(b.id).await;
        f.co.join_chats(cb, vec![chat.id]).await.unwrap();
        while rb.try_recv().is_ok() {}

        let user = f
            .co
            .update_profile(
                &a.id,
                ProfileUpdate {
                    username: Some("Alice_2".into()),
                    avatar_url: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(user.username, "alice_2");
        assert!(matches!(
            next_event(&mut rb).await,
            ServerEvent::ProfileUpdated { .. }
        ));

        let profile = f.co.toggle_favorite(&a.id, chat.id).await.unwrap();
        assert_eq!(profile.favorites, vec![chat.id]);
        let profile = f.co.toggle_favorite(&a.id, chat.id).await.unwrap();
        assert!(profile.favorites.is_empty());
    }
}
