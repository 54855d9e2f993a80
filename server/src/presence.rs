use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Default)]
struct Entry {
    connections: usize,
    online: bool,
    /// Bumped on every connect so a pending offline check can tell it was superseded.
    epoch: u64,
}

/// Per-user connection counting with a grace window before going offline.
pub struct Presence {
    users: Mutex<HashMap<Uuid, Entry>>,
    grace: Duration,
}

impl Presence {
    pub fn new(grace: Duration) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Register a connection. Returns true if the user transitioned to online.
    pub fn connect(&self, user_id: Uuid) -> bool {
        let mut guard = self.users.lock();
        let e = guard.entry(user_id).or_default();
        e.connections += 1;
        e.epoch += 1;
        if e.online {
            false
        } else {
            e.online = true;
            true
        }
    }

    /// Deregister a connection. Resolves after the grace window when this was
    /// the user's last connection, returning true if the user is now offline.
    pub async fn disconnect(&self, user_id: Uuid) -> bool {
        let epoch = {
            let mut guard = self.users.lock();
            let Some(e) = guard.get_mut(&user_id) else {
                return false;
            };
            e.connections = e.connections.saturating_sub(1);
            if e.connections > 0 {
                return false;
            }
            e.epoch
        };
        sleep(self.grace).await;
        let mut guard = self.users.lock();
        match guard.get(&user_id) {
            Some(e) if e.connections == 0 && e.epoch == epoch && e.online => {
                guard.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.users
            .lock()
            .get(user_id)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    pub fn connection_count(&self, user_id: &Uuid) -> usize {
        self.users
            .lock()
            .get(user_id)
            .map(|e| e.connections)
            .unwrap_or(0)
    }
}
