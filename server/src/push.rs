use chat_protocol::ServerEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Topic for a chat's message stream.
pub fn chat_topic(chat_id: &Uuid) -> String {
    format!("chat:{}", chat_id)
}

/// At-most-once publish/subscribe over named topics.
///
/// Publishing to a topic nobody listens on is not an error; lagging
/// subscribers lose events rather than slowing publishers down.
pub struct PushHub {
    topics: Mutex<HashMap<String, broadcast::Sender<ServerEvent>>>,
    capacity: usize,
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ServerEvent> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event, returning how many subscribers it reached.
    pub fn publish(&self, topic: &str, event: ServerEvent) -> usize {
        let mut topics = self.topics.lock();
        let Some(tx) = topics.get(topic) else {
            return 0;
        };
        match tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(topic, "no subscribers left, dropping topic");
                topics.remove(topic);
                0
            }
        }
    }
}
