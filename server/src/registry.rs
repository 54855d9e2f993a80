//! Live connections and the rooms they are joined to.
//!
//! Every connection owns a bounded outbound queue drained by its own writer
//! task. Fan-out only ever uses `try_send`, so one slow socket cannot hold up
//! delivery to the rest of a room; a full queue drops the event for that
//! connection alone.

use chat_protocol::ServerEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnId = u64;

/// Broadcast group a connection can be joined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    /// Account-wide pushes for one user.
    User(Uuid),
    /// Chat-scoped pushes.
    Chat(Uuid),
}

struct Conn {
    user_id: Uuid,
    tx: mpsc::Sender<Arc<str>>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, Conn>,
    rooms: HashMap<Room, HashSet<ConnId>>,
}

impl Inner {
    fn join(&mut self, conn_id: ConnId, room: Room) -> bool {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id);
        true
    }

    fn leave(&mut self, conn_id: ConnId, room: Room) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.rooms.remove(&room);
        }
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
    }

    fn remove(&mut self, conn_id: ConnId) -> Option<Conn> {
        let conn = self.conns.remove(&conn_id)?;
        for room in &conn.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        Some(conn)
    }

    fn user_conns(&self, user_id: &Uuid) -> Vec<ConnId> {
        self.conns
            .iter()
            .filter(|(_, c)| &c.user_id == user_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Connection manager owned by the application state.
pub struct Registry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    queue: usize,
}

impl Registry {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            queue: queue.max(1),
        }
    }

    /// Open a connection for a user and join it to the user's own room.
    pub fn register(&self, user_id: Uuid) -> (ConnId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(self.queue);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.conns.insert(
            id,
            Conn {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        inner.join(id, Room::User(user_id));
        (id, rx)
    }

    /// Close a connection; no further events reach it.
    pub fn unregister(&self, conn_id: ConnId) {
        self.inner.lock().remove(conn_id);
    }

    pub fn user_of(&self, conn_id: ConnId) -> Option<Uuid> {
        self.inner.lock().conns.get(&conn_id).map(|c| c.user_id)
    }

    /// Join a connection to a room. Callers authorize chat rooms first.
    pub fn join(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner.lock().join(conn_id, room)
    }

    pub fn leave(&self, conn_id: ConnId, room: Room) {
        self.inner.lock().leave(conn_id, room);
    }

    /// Join every open connection of a user to a room.
    pub fn join_user(&self, user_id: &Uuid, room: Room) {
        let mut inner = self.inner.lock();
        for id in inner.user_conns(user_id) {
            inner.join(id, room);
        }
    }

    /// Remove every connection of a user from a room.
    pub fn leave_user(&self, user_id: &Uuid, room: Room) {
        let mut inner = self.inner.lock();
        for id in inner.user_conns(user_id) {
            inner.leave(id, room);
        }
    }

    pub fn is_joined(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner
            .lock()
            .rooms
            .get(&room)
            .map(|m| m.contains(&conn_id))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().conns.len()
    }

    /// Send an event to one connection.
    pub fn send_to(&self, conn_id: ConnId, event: &ServerEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        self.deliver(&[conn_id], &frame) == 1
    }

    /// Fan an event out to a room.
    pub fn broadcast(&self, room: Room, event: &ServerEvent, exclude_user: Option<&Uuid>) -> usize {
        self.broadcast_many(&[room], event, exclude_user)
    }

    /// Fan an event out to several rooms, reaching each connection once.
    pub fn broadcast_many(
        &self,
        rooms: &[Room],
        event: &ServerEvent,
        exclude_user: Option<&Uuid>,
    ) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let targets: Vec<ConnId> = {
            let inner = self.inner.lock();
            let mut seen = HashSet::new();
            rooms
                .iter()
                .filter_map(|r| inner.rooms.get(r))
                .flatten()
                .copied()
                .filter(|id| seen.insert(*id))
                .filter(|id| match (exclude_user, inner.conns.get(id)) {
                    (Some(ex), Some(c)) => &c.user_id != ex,
                    _ => true,
                })
                .collect()
        };
        self.deliver(&targets, &frame)
    }

    fn deliver(&self, targets: &[ConnId], frame: &Arc<str>) -> usize {
        let mut inner = self.inner.lock();
        let mut sent = 0;
        let mut closed = Vec::new();
        for id in targets {
            let Some(conn) = inner.conns.get(id) else {
                continue;
            };
            match conn.tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn_id = *id, user_id = %conn.user_id, "outbound queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            debug!(conn_id = id, "pruning closed connection");
            inner.remove(id);
        }
        sent
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(s) => Some(Arc::from(s)),
        Err(e) => {
            warn!(error = %e, "failed to encode event");
            None
        }
    }
}
