use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct TypingTracker {
    last: Mutex<HashMap<(Uuid, Uuid), Instant>>,
    throttle: Duration,
}

impl TypingTracker {
    pub fn new(throttle: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            throttle,
        }
    }

    /// Register a typing signal. Returns true if it should be broadcast.
    ///
    /// A stop signal always goes out and clears the throttle.
    pub fn typing(&self, user_id: Uuid, chat_id: Uuid, is_typing: bool) -> bool {
        let mut guard = self.last.lock();
        let key = (user_id, chat_id);
        if !is_typing {
            guard.remove(&key);
            return true;
        }
        let now = Instant::now();
        let should = match guard.get(&key) {
            Some(&prev) => now.duration_since(prev) >= self.throttle,
            None => true,
        };
        if should {
            guard.insert(key, now);
        }
        should
    }
}
